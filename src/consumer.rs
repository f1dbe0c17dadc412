// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] owns one connection and at most one worker task. The worker
//! pulls deliveries in batches, runs them through the handler chain and
//! settles each batch with a single cumulative ack or nack on its last
//! delivery tag. Handler failures are retried according to the consumer's
//! [`RetryPolicy`]:
//!
//! * success: ack the batch
//! * retry disabled: the error is returned and the worker stops
//! * connectivity failure: nack (requeue) and wait, without bound and
//!   without counting against the limit
//! * bounded failure under the limit: nack (requeue) and wait
//! * bounded failure over the limit: drop the batch by acking it, after the
//!   optional [`RetriesExhausted`] callback has seen it
//!
//! The bounded retry count is only reset by an ack and survives a recovery,
//! so a redelivered batch continues its count.
//!
//! A monitor task watches the session and, when the broker closes it, stops
//! the worker, rebuilds the session and starts the worker again.

use crate::{
    client::Client,
    config::Config,
    context::{Context, Handler, HandlerChain, PanicHandler},
    errors::AmqpError,
    monitor::{self, Recoverable},
    otel,
    retry::{IntervalFn, RetryHandler, RetryPolicy},
    transport::{Delivery, Notification, Session, Transport},
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest time a batch waits for more deliveries after the first one.
pub const DEFAULT_BATCH_PERIOD: Duration = Duration::from_secs(1);

const MODULE: &str = otel::CONSUMER_MODULE;

/// Settles (acks or nacks) a whole batch on a session.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&self, session: &dyn Session, batch: &[Delivery]) -> Result<(), AmqpError>;
}

/// Acks every delivery up to and including the last one of the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CumulativeAck;

#[async_trait]
impl Settle for CumulativeAck {
    async fn settle(&self, session: &dyn Session, batch: &[Delivery]) -> Result<(), AmqpError> {
        match batch.last() {
            Some(last) => session.basic_ack(last.delivery_tag, true).await,
            None => Ok(()),
        }
    }
}

/// Nacks (with requeue) every delivery up to and including the last one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CumulativeNack;

#[async_trait]
impl Settle for CumulativeNack {
    async fn settle(&self, session: &dyn Session, batch: &[Delivery]) -> Result<(), AmqpError> {
        match batch.last() {
            Some(last) => session.basic_nack(last.delivery_tag, true, true).await,
            None => Ok(()),
        }
    }
}

/// Called with a batch that is about to be dropped after its last retry.
#[async_trait]
pub trait RetriesExhausted: Send + Sync {
    async fn on_retries_exhausted(&self, batch: &[Delivery], err: &AmqpError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Working,
    Recovering,
    Closed,
}

#[derive(Clone)]
struct Settings {
    retry: RetryPolicy,
    batch_count: usize,
    batch_period: Duration,
    trace: bool,
    ack: Arc<dyn Settle>,
    nack: Arc<dyn Settle>,
    on_retries_exhausted: Option<Arc<dyn RetriesExhausted>>,
    on_panic: Option<PanicHandler>,
    middlewares: Vec<Arc<dyn Handler>>,
}

struct WorkerHandle {
    exit: CancellationToken,
    handle: JoinHandle<Parked>,
}

/// What a stopped worker hands back to the next one.
struct Parked {
    deliveries: mpsc::Receiver<Delivery>,
    retry_times: u32,
}

struct State {
    client: Client,
    /// Shutdown has been requested.
    existing: bool,
    /// The client has been closed successfully.
    closed: bool,
    chain: Option<HandlerChain>,
    worker: Option<WorkerHandle>,
    /// Handler retries of the batch in flight, kept across recoveries.
    retry_times: u32,
}

struct Inner {
    id: u32,
    key: String,
    conf: Arc<Config>,
    state: Mutex<State>,
    settings: RwLock<Settings>,
    working: Arc<AtomicBool>,
    recovering: AtomicBool,
    closing: AtomicBool,
    exit: CancellationToken,
}

/// Batch consumer of one queue over its own connection.
///
/// Cloning is cheap; every clone drives the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Connects, installs the consumer topology and starts the monitor.
    ///
    /// # Parameters
    /// * `conf` - A consumer configuration
    /// * `idx` - Index of this consumer within its group, used in the
    ///   connection name and in logs
    /// * `transport` - Where sessions come from
    ///
    /// # Returns
    /// The idle consumer or the error of the first failing broker call
    pub async fn new(
        conf: Arc<Config>,
        idx: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Consumer, AmqpError> {
        let Some(consumer_conf) = conf.consumer() else {
            return Err(AmqpError::ConfigError(format!(
                "[{}][{}] is not a consumer config",
                MODULE, conf.key
            )));
        };
        let batch_count = consumer_conf.prefetch_count as usize;

        let client = Client::new(conf.clone(), idx, transport).await?;

        let inner = Arc::new(Inner {
            id: idx,
            key: conf.key.clone(),
            conf,
            state: Mutex::new(State {
                client,
                existing: false,
                closed: false,
                chain: None,
                worker: None,
                retry_times: 0,
            }),
            settings: RwLock::new(Settings {
                retry: RetryPolicy::consumer(),
                batch_count,
                batch_period: DEFAULT_BATCH_PERIOD,
                trace: true,
                ack: Arc::new(CumulativeAck),
                nack: Arc::new(CumulativeNack),
                on_retries_exhausted: None,
                on_panic: None,
                middlewares: vec![],
            }),
            working: Arc::new(AtomicBool::new(false)),
            recovering: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            exit: CancellationToken::new(),
        });

        monitor::spawn(Arc::downgrade(&inner), inner.exit.clone());
        info!(key = inner.key, id = idx, "[{}] init success", MODULE);

        Ok(Consumer { inner })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.conf
    }

    pub fn is_working(&self) -> bool {
        self.inner.working.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConsumerState {
        if self.inner.closing.load(Ordering::SeqCst) {
            ConsumerState::Closed
        } else if self.inner.recovering.load(Ordering::SeqCst) {
            ConsumerState::Recovering
        } else if self.is_working() {
            ConsumerState::Working
        } else {
            ConsumerState::Idle
        }
    }

    /// Appends middlewares; they run before the handler given to [`work`].
    /// Only effective before the first `work` call.
    ///
    /// [`work`]: Consumer::work
    pub fn use_handlers<I>(&self, handlers: I) -> &Self
    where
        I: IntoIterator<Item = Arc<dyn Handler>>,
    {
        self.update(|s| s.middlewares.extend(handlers));
        self
    }

    /// Failed batches are no longer retried; the first failure stops the worker.
    pub fn disable_retry(&self) -> &Self {
        self.update(|s| s.retry.enable = false);
        self
    }

    /// 0 retries without bound.
    pub fn set_max_retry_times(&self, times: u32) -> &Self {
        self.update(|s| s.retry.max_retry_times = times);
        self
    }

    pub fn set_retry_interval<F>(&self, interval: F) -> &Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        let interval: IntervalFn = Arc::new(interval);
        self.update(|s| s.retry.interval = interval);
        self
    }

    pub fn set_batch_count(&self, count: usize) -> &Self {
        self.update(|s| s.batch_count = count);
        self
    }

    pub fn set_batch_period(&self, period: Duration) -> &Self {
        self.update(|s| s.batch_period = period);
        self
    }

    pub fn disable_trace(&self) -> &Self {
        self.update(|s| s.trace = false);
        self
    }

    /// Replaces the cumulative ack used after a successful (or dropped) batch.
    pub fn set_ack_fn(&self, ack: Arc<dyn Settle>) -> &Self {
        self.update(|s| s.ack = ack);
        self
    }

    /// Replaces the cumulative nack used before a retry.
    pub fn set_nack_fn(&self, nack: Arc<dyn Settle>) -> &Self {
        self.update(|s| s.nack = nack);
        self
    }

    pub fn on_retries_exhausted(&self, callback: Arc<dyn RetriesExhausted>) -> &Self {
        self.update(|s| s.on_retries_exhausted = Some(callback));
        self
    }

    /// Replaces the default panic conversion of the handler chain. The
    /// returned error goes through the usual retry policy.
    pub fn set_panic_handler(&self, handler: PanicHandler) -> &Self {
        self.update(|s| s.on_panic = Some(handler));
        self
    }

    /// Starts the worker with `handler` as the last link of the chain.
    ///
    /// The chain is frozen on the first call; later calls only restart a
    /// worker that stopped. Returns [`AmqpError::AlreadyWorking`] while a
    /// worker is running.
    pub async fn work(&self, handler: Arc<dyn Handler>) -> Result<(), AmqpError> {
        let inner = &self.inner;
        if inner
            .working
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AmqpError::AlreadyWorking(inner.key.clone()));
        }

        let mut state = inner.state.lock().await;
        if state.existing {
            inner.working.store(false, Ordering::SeqCst);
            return Err(AmqpError::ClientClosing(format!(
                "[{}][{}][{}] client is going to exit",
                MODULE, inner.key, inner.id
            )));
        }

        if state.chain.is_none() {
            let mut chain = inner.settings().middlewares;
            chain.push(handler);
            state.chain = Some(chain.into());
        }

        inner.stop_run(&mut state).await;
        if !inner.start_worker(&mut state) {
            inner.working.store(false, Ordering::SeqCst);
            warn!(
                key = inner.key,
                id = inner.id,
                "session is not ready, the worker starts after recovery"
            );
        }
        Ok(())
    }

    /// Stops the monitor and the worker, then closes the connection.
    ///
    /// A batch in flight finishes its current step; waits are interrupted.
    /// Once a close has succeeded, further calls return
    /// [`AmqpError::AlreadyClosed`] without touching the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(AmqpError::AlreadyClosed(format!(
                "[{}][{}][{}]",
                MODULE, inner.key, inner.id
            )));
        }

        state.existing = true;
        inner.closing.store(true, Ordering::SeqCst);
        inner.exit.cancel();
        inner.stop_run(&mut state).await;

        state.client.close().await?;
        state.closed = true;
        info!(key = inner.key, id = inner.id, "[{}] shutdown success", MODULE);
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
    }
}

impl Inner {
    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawns a worker over the current session; `false` when there is no
    /// chain or no live delivery stream.
    fn start_worker(&self, state: &mut State) -> bool {
        let Some(chain) = state.chain.clone() else {
            return false;
        };
        let Some(session) = state.client.session() else {
            return false;
        };
        let Some(deliveries) = state.client.take_deliveries() else {
            return false;
        };

        let settings = self.settings();
        let exit = self.exit.child_token();
        let retry = RetryHandler::new(settings.retry.clone(), &self.key, self.id)
            .with_retry_times(state.retry_times);
        let worker = Worker {
            id: self.id,
            key: self.key.clone(),
            session,
            deliveries,
            chain,
            connectivity: retry.fork(),
            retry,
            batch_count: settings.batch_count,
            batch_period: settings.batch_period,
            trace: settings.trace,
            ack: settings.ack,
            nack: settings.nack,
            on_retries_exhausted: settings.on_retries_exhausted,
            on_panic: settings.on_panic,
            working: self.working.clone(),
            exit: exit.clone(),
        };

        state.worker = Some(WorkerHandle {
            exit,
            handle: tokio::spawn(worker.run()),
        });
        true
    }

    /// Signals the worker and waits until it has returned.
    async fn stop_run(&self, state: &mut State) {
        let Some(worker) = state.worker.take() else {
            return;
        };
        worker.exit.cancel();
        match worker.handle.await {
            Ok(parked) => {
                state.retry_times = parked.retry_times;
                state.client.restore_deliveries(parked.deliveries);
            }
            Err(err) => {
                error!(
                    key = self.key,
                    id = self.id,
                    error = err.to_string(),
                    "worker task failed"
                );
                self.working.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl Recoverable for Inner {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn id(&self) -> u32 {
        self.id
    }

    async fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.state.lock().await.client.take_notifications()
    }

    async fn recover(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if state.existing {
            return Ok(());
        }

        self.recovering.store(true, Ordering::SeqCst);
        self.stop_run(&mut state).await;
        let res = state.client.recover().await;
        self.recovering.store(false, Ordering::SeqCst);
        res?;

        if state.chain.is_some()
            && self
                .working
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if self.start_worker(&mut state) {
                info!(key = self.key, id = self.id, "worker recover to run again");
            } else {
                self.working.store(false, Ordering::SeqCst);
            }
        }

        info!(key = self.key, id = self.id, "[{}] recover success", MODULE);
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}

/// The batching loop of one consumer, bound to one session.
struct Worker {
    id: u32,
    key: String,
    session: Arc<dyn Session>,
    deliveries: mpsc::Receiver<Delivery>,
    chain: HandlerChain,
    /// Bounded handler retries.
    retry: RetryHandler,
    /// Connectivity retries; never counted against the bound.
    connectivity: RetryHandler,
    batch_count: usize,
    batch_period: Duration,
    trace: bool,
    ack: Arc<dyn Settle>,
    nack: Arc<dyn Settle>,
    on_retries_exhausted: Option<Arc<dyn RetriesExhausted>>,
    on_panic: Option<PanicHandler>,
    working: Arc<AtomicBool>,
    exit: CancellationToken,
}

impl Worker {
    /// Runs until the exit signal or an unrecoverable batch error; hands the
    /// delivery stream and the retry count back so a restarted worker can
    /// continue where this one stopped.
    async fn run(mut self) -> Parked {
        while let Some(batch) = self.next_batch().await {
            if self.handle_message(&batch).await.is_err() {
                break;
            }
        }

        self.working.store(false, Ordering::SeqCst);
        info!(
            key = self.key,
            id = self.id,
            "the consumer's worker is about to be closed"
        );
        Parked {
            deliveries: self.deliveries,
            retry_times: self.retry.retry_times(),
        }
    }

    /// `None` once the worker has to stop.
    async fn next_batch(&mut self) -> Option<Vec<Delivery>> {
        let first = tokio::select! {
            biased;
            _ = self.exit.cancelled() => return None,
            delivery = self.deliveries.recv() => delivery,
        };

        let Some(first) = first else {
            warn!(
                key = self.key,
                id = self.id,
                "delivery stream closed, waiting for recovery"
            );
            self.exit.cancelled().await;
            return None;
        };

        // exit has priority over deliveries already buffered
        if self.exit.is_cancelled() {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_count.max(1));
        batch.push(first);

        let timer = tokio::time::sleep(self.batch_period);
        tokio::pin!(timer);
        while batch.len() < self.batch_count {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => return None,
                delivery = self.deliveries.recv() => match delivery {
                    Some(delivery) => batch.push(delivery),
                    None => break,
                },
                _ = &mut timer => break,
            }
        }

        Some(batch)
    }

    /// Runs the chain over `batch` and settles it.
    ///
    /// An error means the worker must stop.
    async fn handle_message(&mut self, batch: &[Delivery]) -> Result<(), AmqpError> {
        let started = Instant::now();
        let parent = batch
            .first()
            .map(|d| otel::extract_context(&d.properties))
            .unwrap_or_default();

        let mut ctx = Context::new(self.chain.clone(), parent.clone(), self.exit.clone());
        if let Some(handler) = &self.on_panic {
            ctx = ctx.with_panic_handler(handler.clone());
        }
        let res = ctx.handle(batch, self.id).await;
        if self.trace {
            otel::trace_batch(&parent, batch, self.id, started.elapsed(), res.as_ref().err());
        }

        let err = match res {
            Ok(()) => return self.ack(batch).await,
            Err(err) => err,
        };

        if !self.retry.enable() {
            error!(
                key = self.key,
                id = self.id,
                error = err.to_string(),
                "failure to handle messages, retry is disabled"
            );
            return Err(err);
        }

        if self.retry.infinite_retry(&err) {
            self.nack(batch).await?;
            return self
                .connectivity
                .wait_for_next_retry(&err, "handle", &self.exit)
                .await;
        }

        if self.retry.exceeded_limit() {
            self.retry.clear_retried_times();
            error!(
                key = self.key,
                id = self.id,
                error = err.to_string(),
                "retries have exceeded limit: [{}], discard message...",
                self.retry.max_retry_times()
            );
            if let Some(callback) = &self.on_retries_exhausted {
                callback.on_retries_exhausted(batch, &err).await;
            }
            return self.ack(batch).await;
        }

        self.nack(batch).await?;
        self.retry.wait_for_next_retry(&err, "handle", &self.exit).await
    }

    async fn ack(&mut self, batch: &[Delivery]) -> Result<(), AmqpError> {
        let ack = self.ack.clone();
        self.settle(ack.as_ref(), batch, "ack").await?;
        self.retry.clear_retried_times();
        self.connectivity.clear_retried_times();
        Ok(())
    }

    async fn nack(&mut self, batch: &[Delivery]) -> Result<(), AmqpError> {
        let nack = self.nack.clone();
        self.settle(nack.as_ref(), batch, "nack").await
    }

    /// Retries the broker call until it succeeds or the worker exits.
    ///
    /// Waits are counted on a fork of the retry handler so the handler
    /// retry counter is left untouched.
    async fn settle(
        &self,
        settler: &dyn Settle,
        batch: &[Delivery],
        event: &str,
    ) -> Result<(), AmqpError> {
        let mut err = match settler.settle(self.session.as_ref(), batch).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let mut retry = self.retry.fork();
        loop {
            warn!(
                key = self.key,
                id = self.id,
                error = err.to_string(),
                event,
                "failure to settle messages"
            );
            retry.wait_for_next_retry(&err, event, &self.exit).await?;
            match settler.settle(self.session.as_ref(), batch).await {
                Ok(()) => return Ok(()),
                Err(e) => err = e,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{consumer_config, eventually, FakeBroker};
    use std::{any::Any, sync::atomic::AtomicUsize, sync::Mutex as StdMutex};

    /// Terminal handler that records batch tags and answers from a script.
    struct Script {
        batches: StdMutex<Vec<Vec<u64>>>,
        fail_with: Option<fn() -> AmqpError>,
    }

    impl Script {
        fn ok() -> Arc<Self> {
            Arc::new(Script {
                batches: StdMutex::new(vec![]),
                fail_with: None,
            })
        }

        fn failing(fail_with: fn() -> AmqpError) -> Arc<Self> {
            Arc::new(Script {
                batches: StdMutex::new(vec![]),
                fail_with: Some(fail_with),
            })
        }

        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().unwrap().clone()
        }

        fn calls(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Handler for Script {
        async fn handle(&self, _: &mut Context, batch: &[Delivery], _: u32) -> Result<(), AmqpError> {
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|d| d.delivery_tag).collect());
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Exhausted {
        seen: StdMutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl RetriesExhausted for Exhausted {
        async fn on_retries_exhausted(&self, batch: &[Delivery], err: &AmqpError) {
            self.seen.lock().unwrap().push((batch.len(), err.to_string()));
        }
    }

    async fn consumer(broker: &FakeBroker, prefetch_count: u32) -> Consumer {
        let conf = consumer_config("RabbitMQ.Orders", prefetch_count);
        let consumer = Consumer::new(conf, 0, broker.transport()).await.unwrap();
        consumer.disable_trace();
        consumer
    }

    #[tokio::test(start_paused = true)]
    async fn installs_consumer_topology() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 10).await;

        assert_eq!(
            broker.calls(),
            vec![
                "connect:RabbitMQ.Orders-0",
                "exchange_declare:e.orders:topic",
                "queue_declare:q.orders",
                "queue_bind:q.orders:e.orders:orders.#",
                "basic_qos:10",
                "basic_consume:q.orders:orders-tag",
            ]
        );
        assert_eq!(consumer.state(), ConsumerState::Idle);
        assert_eq!(consumer.id(), 0);
        assert_eq!(consumer.key(), "RabbitMQ.Orders");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_topology_closes_the_session() {
        let broker = FakeBroker::new();
        broker.fail_queue_declare(true);

        let res = Consumer::new(consumer_config("k", 1), 0, broker.transport()).await;

        assert!(matches!(res, Err(AmqpError::DeclareQueueError(_))));
        assert_eq!(broker.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_settled_with_one_cumulative_ack() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 10).await;
        for body in ["a", "b", "c"] {
            broker.push(body);
        }

        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();
        eventually(|| !broker.acks().is_empty()).await;

        assert_eq!(handler.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(broker.acks(), vec![(3, true)]);
        assert!(broker.nacks().is_empty());
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_cut_by_batch_count() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 10).await;
        consumer.set_batch_count(2);
        for body in ["a", "b", "c", "d"] {
            broker.push(body);
        }

        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();
        eventually(|| broker.acks().len() == 2).await;

        assert_eq!(handler.batches(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(broker.acks(), vec![(2, true), (4, true)]);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn one_ack_per_delivery_without_recover() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();

        for body in ["a", "b", "c", "d", "e"] {
            broker.push(body);
        }
        eventually(|| broker.acks().len() == 5).await;

        assert_eq!(
            broker.acks(),
            vec![(1, true), (2, true), (3, true), (4, true), (5, true)]
        );
        assert!(broker.nacks().is_empty());
        assert_eq!(broker.connects(), 1);
        assert_eq!(consumer.state(), ConsumerState::Working);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_failures_nack_then_drop() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        let exhausted = Arc::new(Exhausted::default());
        consumer
            .set_max_retry_times(3)
            .on_retries_exhausted(exhausted.clone());

        let handler = Script::failing(|| AmqpError::handler("invalid payload"));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("poison");
        eventually(|| !broker.acks().is_empty()).await;

        assert_eq!(broker.nacks(), vec![(1, true, true), (2, true, true), (3, true, true)]);
        assert_eq!(broker.acks(), vec![(4, true)]);
        assert_eq!(handler.calls(), 4);
        assert_eq!(exhausted.seen.lock().unwrap().len(), 1);

        // the counter starts over for the next message
        broker.push("poison again");
        eventually(|| broker.acks().len() == 2).await;
        assert_eq!(broker.nacks().len(), 6);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_failures_are_never_acked() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.set_max_retry_times(2);

        let handler =
            Script::failing(|| AmqpError::RetryInfinitely("downstream unavailable".to_owned()));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| broker.nacks().len() >= 6).await;

        assert!(broker.acks().is_empty());
        consumer.close().await.unwrap();
        assert!(broker.acks().is_empty());
    }

    /// Fails with a connectivity error `infinite` times, then with a bounded
    /// error forever.
    struct Flaky {
        calls: AtomicUsize,
        infinite: usize,
    }

    #[async_trait]
    impl Handler for Flaky {
        async fn handle(&self, _: &mut Context, _: &[Delivery], _: u32) -> Result<(), AmqpError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.infinite {
                Err(AmqpError::RetryInfinitely("downstream unavailable".to_owned()))
            } else {
                Err(AmqpError::handler("invalid payload"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_retries_leave_the_bound_untouched() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.set_max_retry_times(3);

        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            infinite: 4,
        });
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| !broker.acks().is_empty()).await;

        // four connectivity nacks, then the full bounded budget
        assert_eq!(broker.nacks().len(), 7);
        assert_eq!(broker.acks(), vec![(8, true)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_disabled_stops_the_worker() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.disable_retry();

        let handler = Script::failing(|| AmqpError::handler("invalid payload"));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| !consumer.is_working()).await;

        assert_eq!(handler.calls(), 1);
        assert!(broker.acks().is_empty());
        assert!(broker.nacks().is_empty());

        // a stopped worker can be started again on the same stream
        consumer.work(Script::ok()).await.unwrap();
        assert!(consumer.is_working());
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn middlewares_run_before_the_handler() {
        struct Tenant;

        #[async_trait]
        impl Handler for Tenant {
            async fn handle(&self, ctx: &mut Context, batch: &[Delivery], idx: u32) -> Result<(), AmqpError> {
                ctx.set("tenant", "acme".to_owned());
                ctx.next(batch, idx).await
            }
        }

        struct RequireTenant;

        #[async_trait]
        impl Handler for RequireTenant {
            async fn handle(&self, ctx: &mut Context, _: &[Delivery], _: u32) -> Result<(), AmqpError> {
                match ctx.get::<String>("tenant") {
                    Some(tenant) if tenant == "acme" => Ok(()),
                    _ => Err(AmqpError::handler("missing tenant")),
                }
            }
        }

        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.use_handlers([Arc::new(Tenant) as Arc<dyn Handler>]);

        consumer.work(Arc::new(RequireTenant)).await.unwrap();
        broker.push("payload");
        eventually(|| !broker.acks().is_empty()).await;

        assert!(broker.nacks().is_empty());
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn work_twice_is_rejected() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;

        consumer.work(Script::ok()).await.unwrap();
        let err = consumer.work(Script::ok()).await.unwrap_err();

        assert!(matches!(err, AmqpError::AlreadyWorking(_)));
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acks_are_retried() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        broker.fail_acks(2);

        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| !broker.acks().is_empty()).await;

        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.count_calls("basic_ack:1:true"), 3);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn custom_ack_replaces_cumulative_ack() {
        struct AckEach;

        #[async_trait]
        impl Settle for AckEach {
            async fn settle(&self, session: &dyn Session, batch: &[Delivery]) -> Result<(), AmqpError> {
                for delivery in batch {
                    session.basic_ack(delivery.delivery_tag, false).await?;
                }
                Ok(())
            }
        }

        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 5).await;
        consumer.set_ack_fn(Arc::new(AckEach));
        broker.push("a");
        broker.push("b");

        consumer.work(Script::ok()).await.unwrap();
        eventually(|| broker.acks().len() == 2).await;

        assert_eq!(broker.acks(), vec![(1, false), (2, false)]);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_twice_is_rejected_without_io() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.work(Script::ok()).await.unwrap();

        consumer.close().await.unwrap();
        let calls = broker.calls();
        assert_eq!(&calls[calls.len() - 2..], ["basic_cancel:orders-tag", "close"]);

        let err = consumer.close().await.unwrap_err();
        assert!(matches!(err, AmqpError::AlreadyClosed(_)));
        assert_eq!(broker.calls(), calls);
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(!consumer.is_working());
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_retry_wait() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.set_retry_interval(|_| Duration::from_secs(3600));

        let handler = Script::failing(|| AmqpError::handler("invalid payload"));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| !broker.nacks().is_empty()).await;

        let started = tokio::time::Instant::now();
        consumer.close().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_batch_wait() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 10).await;
        consumer.set_batch_period(Duration::from_secs(3600));

        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();
        broker.push("lonely");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        consumer.close().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.calls(), 0);
        assert!(broker.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_recovers_once_and_resumes() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();

        broker.push("before");
        eventually(|| broker.acks().len() == 1).await;

        broker.kill_connection("CONNECTION_FORCED");
        eventually(|| broker.count_calls("basic_consume") == 2).await;
        eventually(|| consumer.is_working()).await;

        broker.push("after");
        eventually(|| broker.acks().len() == 2).await;

        assert_eq!(broker.connects(), 2);
        assert_eq!(handler.calls(), 2);
        assert_eq!(consumer.state(), ConsumerState::Working);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_is_retried_until_the_broker_is_back() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();

        broker.fail_connects(2);
        broker.kill_connection("CONNECTION_FORCED");
        eventually(|| broker.connects() == 4).await;
        eventually(|| consumer.is_working()).await;

        broker.push("after");
        eventually(|| broker.acks().len() == 1).await;
        assert_eq!(handler.calls(), 1);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_deliveries_are_redelivered_after_recovery() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer.set_retry_interval(|_| Duration::from_secs(3600));

        let handler = Script::failing(|| AmqpError::handler("invalid payload"));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("payload");
        eventually(|| handler.calls() == 1).await;

        broker.kill_connection("CONNECTION_FORCED");
        eventually(|| handler.calls() == 2).await;

        assert_eq!(broker.connects(), 2);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_survives_recovery() {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer
            .set_max_retry_times(3)
            .set_retry_interval(|_| Duration::from_secs(10));

        let handler = Script::failing(|| AmqpError::handler("invalid payload"));
        consumer.work(handler.clone()).await.unwrap();
        broker.push("poison");
        eventually(|| broker.nacks().len() == 2).await;

        broker.kill_connection("CONNECTION_FORCED");
        eventually(|| !broker.acks().is_empty()).await;

        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.nacks().len(), 3);
        assert_eq!(broker.acks(), vec![(5, true)]);
        assert_eq!(handler.calls(), 4);
        consumer.close().await.unwrap();
    }

    async fn recovers_once_after(trigger: impl FnOnce(&FakeBroker)) {
        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        let handler = Script::ok();
        consumer.work(handler.clone()).await.unwrap();

        broker.push("before");
        eventually(|| broker.acks().len() == 1).await;

        trigger(&broker);
        eventually(|| broker.count_calls("basic_consume") == 2).await;
        eventually(|| consumer.is_working()).await;

        broker.push("after");
        eventually(|| broker.acks().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.count_calls("basic_consume"), 2);
        assert_eq!(handler.calls(), 2);
        assert_eq!(consumer.state(), ConsumerState::Working);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_recovers_once_and_resumes() {
        recovers_once_after(|broker| broker.kill_channel("PRECONDITION_FAILED")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_consumer_recovers_once_and_resumes() {
        recovers_once_after(|broker| broker.cancel_consumer("queue deleted")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn panic_handler_decides_the_retry() {
        struct Boom;

        #[async_trait]
        impl Handler for Boom {
            async fn handle(&self, _: &mut Context, _: &[Delivery], _: u32) -> Result<(), AmqpError> {
                panic!("pool exhausted");
            }
        }

        let broker = FakeBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer
            .set_max_retry_times(1)
            .set_panic_handler(Arc::new(
                |panic: Box<dyn Any + Send>, _: &[Delivery], _: u32| {
                    let reason = panic.downcast_ref::<&str>().copied().unwrap_or_default();
                    AmqpError::RetryInfinitely(reason.to_owned())
                },
            ));

        consumer.work(Arc::new(Boom)).await.unwrap();
        broker.push("payload");
        eventually(|| broker.nacks().len() >= 3).await;

        assert!(broker.acks().is_empty());
        consumer.close().await.unwrap();
    }
}
