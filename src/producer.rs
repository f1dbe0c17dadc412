// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! A [`Producer`] publishes to one exchange with one routing key over its own
//! connection. Every publish is bounded in time twice: once for handing the
//! message to the channel and once for the broker's publisher confirm.
//! Failed attempts are retried with the producer's [`RetryPolicy`].
//!
//! When the connection drops while a confirm is outstanding the publish is
//! reported as successful: the message was written and most likely reached
//! the broker, and publishing it again would risk a duplicate.

use crate::{
    client::Client,
    config::Config,
    errors::{AmqpError, ErrorCode},
    monitor::{self, Recoverable},
    otel,
    retry::{IntervalFn, RetryHandler, RetryPolicy},
    transport::{Confirmation, Message, Notification, PendingConfirm, Transport},
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest time a message may take to be handed to the channel.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest time to wait for the broker's confirm.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

const MODULE: &str = otel::PRODUCER_MODULE;

/// Records one finished publish: the message, its cost and its error.
pub type TraceFn = Arc<dyn Fn(&Message, Duration, Option<&AmqpError>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Ready,
    Recovering,
    Closed,
}

#[derive(Clone)]
struct Settings {
    retry: RetryPolicy,
    publish_timeout: Duration,
    confirm_timeout: Duration,
    trace: bool,
    trace_fn: TraceFn,
}

struct State {
    client: Client,
    existing: bool,
    closed: bool,
}

struct Inner {
    id: u32,
    key: String,
    conf: Arc<Config>,
    exchange: String,
    routing_key: String,
    persistent: bool,
    no_confirm: bool,
    state: Mutex<State>,
    settings: RwLock<Settings>,
    recovering: AtomicBool,
    closing: AtomicBool,
    exit: CancellationToken,
}

/// Confirmed publisher over its own connection.
///
/// Cloning is cheap and publishes may run concurrently; each call keeps its
/// own retry counter.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    /// Connects, installs the producer topology and starts the monitor.
    pub async fn new(
        conf: Arc<Config>,
        idx: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Producer, AmqpError> {
        let Some(producer_conf) = conf.producer() else {
            return Err(AmqpError::ConfigError(format!(
                "[{}][{}] is not a producer config",
                MODULE, conf.key
            )));
        };
        let exchange = producer_conf.exchange.clone();
        let routing_key = producer_conf.routing_key.clone();
        let persistent = producer_conf.persistent;
        let no_confirm = producer_conf.no_confirm;

        let client = Client::new(conf.clone(), idx, transport).await?;

        let inner = Arc::new(Inner {
            id: idx,
            key: conf.key.clone(),
            conf,
            exchange,
            routing_key,
            persistent,
            no_confirm,
            state: Mutex::new(State {
                client,
                existing: false,
                closed: false,
            }),
            settings: RwLock::new(Settings {
                retry: RetryPolicy::producer(),
                publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
                confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
                trace: true,
                trace_fn: Arc::new(otel::trace_publish),
            }),
            recovering: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            exit: CancellationToken::new(),
        });

        monitor::spawn(Arc::downgrade(&inner), inner.exit.clone());
        info!(key = inner.key, id = idx, "[{}] init success", MODULE);

        Ok(Producer { inner })
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

    pub fn state(&self) -> ProducerState {
        if self.inner.closing.load(Ordering::SeqCst) {
            ProducerState::Closed
        } else if self.inner.recovering.load(Ordering::SeqCst) {
            ProducerState::Recovering
        } else {
            ProducerState::Ready
        }
    }

    /// 0 means a single attempt.
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

    pub fn disable_retry(&self) -> &Self {
        self.update(|s| s.retry.enable = false);
        self
    }

    pub fn set_publish_timeout(&self, timeout: Duration) -> &Self {
        self.update(|s| s.publish_timeout = timeout);
        self
    }

    pub fn set_confirm_timeout(&self, timeout: Duration) -> &Self {
        self.update(|s| s.confirm_timeout = timeout);
        self
    }

    pub fn disable_trace(&self) -> &Self {
        self.update(|s| s.trace = false);
        self
    }

    /// Replaces the default publish span; also re-enables tracing.
    pub fn set_trace_fn<F>(&self, trace_fn: F) -> &Self
    where
        F: Fn(&Message, Duration, Option<&AmqpError>) + Send + Sync + 'static,
    {
        let trace_fn: TraceFn = Arc::new(trace_fn);
        self.update(|s| {
            s.trace = true;
            s.trace_fn = trace_fn;
        });
        self
    }

    /// Publishes `message` to the configured exchange and routing key.
    ///
    /// # Parameters
    /// * `message` - The message to publish; the current trace context is
    ///   added to its headers and, for persistent producers, its delivery
    ///   mode is set to 2
    ///
    /// # Returns
    /// `Ok(())` once the broker confirmed the message (or right after the
    /// write in no-confirm mode). [`AmqpError::ClientClosing`] when the
    /// producer shuts down before the message was written; otherwise the
    /// error of the last attempt.
    pub async fn publish(&self, message: Message) -> Result<(), AmqpError> {
        let inner = &self.inner;
        let settings = inner.settings();
        let message = inner.prepare(message);
        let started = Instant::now();

        let res = inner.publish_with_retry(&message, &settings).await;
        if settings.trace {
            (settings.trace_fn)(&message, started.elapsed(), res.as_ref().err());
        }
        res
    }

    /// Stops the monitor, aborts publish and confirm waits and closes the
    /// connection. Once a close has succeeded, further calls return
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

    fn prepare(&self, mut message: Message) -> Message {
        if self.persistent {
            message = message.persistent();
        }
        message.properties = otel::inject_context(std::mem::take(&mut message.properties));
        message
    }

    fn closing_error(&self) -> AmqpError {
        AmqpError::ClientClosing(format!(
            "[{}][{}][{}] client is going to exit",
            MODULE, self.key, self.id
        ))
    }

    async fn publish_with_retry(
        &self,
        message: &Message,
        settings: &Settings,
    ) -> Result<(), AmqpError> {
        let mut retry = RetryHandler::new(settings.retry.clone(), &self.key, self.id);

        loop {
            if self.exit.is_cancelled() {
                return Err(self.closing_error());
            }

            let err = match self.publish_once(message, settings).await {
                Ok(_) if self.no_confirm => return Ok(()),
                Ok(pending) => match self.confirm(pending, settings).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_code(ErrorCode::ClientClosed) => {
                        warn!(
                            key = self.key,
                            id = self.id,
                            message_id = message.message_id(),
                            error = err.to_string(),
                            "confirmation lost on shutdown, the message is probably delivered"
                        );
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(
                            key = self.key,
                            id = self.id,
                            message_id = message.message_id(),
                            body = String::from_utf8_lossy(&message.data).to_string(),
                            error = err.to_string(),
                            "get message confirmation fail"
                        );
                        err
                    }
                },
                Err(err) if err.is_code(ErrorCode::ClientClosed) => return Err(err),
                Err(err) => {
                    warn!(
                        key = self.key,
                        id = self.id,
                        message_id = message.message_id(),
                        body = String::from_utf8_lossy(&message.data).to_string(),
                        error = err.to_string(),
                        "push message fail"
                    );
                    err
                }
            };

            if !retry.enable() || retry.retry_times() >= retry.max_retry_times() {
                return Err(err);
            }
            retry.wait_for_next_retry(&err, "publish", &self.exit).await?;
        }
    }

    /// Hands `message` to the channel within the publish timeout.
    async fn publish_once(
        &self,
        message: &Message,
        settings: &Settings,
    ) -> Result<PendingConfirm, AmqpError> {
        let publish = async {
            let session = self.state.lock().await.client.session().ok_or_else(|| {
                AmqpError::ConnectionError(format!(
                    "[{}][{}][{}] session is not ready",
                    MODULE, self.key, self.id
                ))
            })?;
            session
                .basic_publish(&self.exchange, &self.routing_key, message)
                .await
        };

        tokio::select! {
            biased;
            _ = self.exit.cancelled() => Err(self.closing_error()),
            res = tokio::time::timeout(settings.publish_timeout, publish) => match res {
                Ok(res) => res,
                Err(_) => Err(AmqpError::GatewayTimeout(format!(
                    "[{}][{}][{}] publish timeout",
                    MODULE, self.key, self.id
                ))),
            },
        }
    }

    /// Waits for the broker's answer within the confirm timeout.
    async fn confirm(&self, pending: PendingConfirm, settings: &Settings) -> Result<(), AmqpError> {
        tokio::select! {
            biased;
            _ = self.exit.cancelled() => Err(self.closing_error()),
            res = tokio::time::timeout(settings.confirm_timeout, pending) => match res {
                Ok(Ok(Confirmation::Nack)) => Err(AmqpError::PublishNackedError),
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(AmqpError::GatewayTimeout(format!(
                    "[{}][{}][{}] confirm timeout",
                    MODULE, self.key, self.id
                ))),
            },
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
        let res = state.client.recover().await;
        self.recovering.store(false, Ordering::SeqCst);
        res?;

        info!(key = self.key, id = self.id, "[{}] recover success", MODULE);
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}
