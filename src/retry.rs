// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Both engines decide when, and for how long, to back off through a
//! [`RetryHandler`]. A handler pairs a [`RetryPolicy`] (enable flag, retry
//! bound, interval strategy) with the retry counter of the episode in
//! progress. Every wait races against the owner's exit token so shutdown is
//! observed immediately rather than after the full interval.

use crate::errors::AmqpError;
use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default bound of the consumer: a batch is retried 5 times before drop.
pub const DEFAULT_CONSUMER_MAX_RETRY_TIMES: u32 = 5;
/// Default bound of the producer: a message gets 3 attempts.
pub const DEFAULT_PRODUCER_MAX_RETRY_TIMES: u32 = 2;

/// Maps the retry number (starting at 1) to the wait before that retry.
pub type IntervalFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// 1s, 5s, 10s, 30s, then one minute.
pub fn consumer_retry_interval(retry_times: u32) -> Duration {
    match retry_times {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(5),
        3 => Duration::from_secs(10),
        4 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}

/// 1s, 2s, 4s, 16s, then one minute.
pub fn producer_retry_interval(retry_times: u32) -> Duration {
    match retry_times {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        3 => Duration::from_secs(4),
        4 => Duration::from_secs(16),
        _ => Duration::from_secs(60),
    }
}

/// Configuration half of a [`RetryHandler`].
#[derive(Clone)]
pub struct RetryPolicy {
    pub(crate) enable: bool,
    /// 0 means unlimited.
    pub(crate) max_retry_times: u32,
    pub(crate) interval: IntervalFn,
}

impl RetryPolicy {
    pub fn consumer() -> Self {
        RetryPolicy {
            enable: true,
            max_retry_times: DEFAULT_CONSUMER_MAX_RETRY_TIMES,
            interval: Arc::new(consumer_retry_interval),
        }
    }

    pub fn producer() -> Self {
        RetryPolicy {
            enable: true,
            max_retry_times: DEFAULT_PRODUCER_MAX_RETRY_TIMES,
            interval: Arc::new(producer_retry_interval),
        }
    }

    pub fn max_retry_times(&self) -> u32 {
        self.max_retry_times
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("enable", &self.enable)
            .field("max_retry_times", &self.max_retry_times)
            .finish_non_exhaustive()
    }
}

/// Retry state of one consumer worker or one publish call.
#[derive(Debug)]
pub struct RetryHandler {
    policy: RetryPolicy,
    retry_times: u32,
    key: String,
    id: u32,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy, key: &str, id: u32) -> Self {
        RetryHandler {
            policy,
            retry_times: 0,
            key: key.to_owned(),
            id,
        }
    }

    /// A handler with the same policy and a fresh counter.
    pub fn fork(&self) -> Self {
        RetryHandler::new(self.policy.clone(), &self.key, self.id)
    }

    /// Continues an episode that was interrupted after `retry_times` retries.
    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn enable(&self) -> bool {
        self.policy.enable
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    pub fn max_retry_times(&self) -> u32 {
        self.policy.max_retry_times
    }

    /// Whether `err` deserves retries without bound.
    pub fn infinite_retry(&self, err: &AmqpError) -> bool {
        let infinitely = infinite_retry(err);
        if infinitely {
            warn!(
                key = self.key,
                id = self.id,
                error = err.to_string(),
                "connectivity error, triggers continuous retry..."
            );
        }
        infinitely
    }

    pub fn exceeded_limit(&self) -> bool {
        self.policy.max_retry_times > 0 && self.retry_times >= self.policy.max_retry_times
    }

    pub fn clear_retried_times(&mut self) {
        self.retry_times = 0;
    }

    /// Counts one more retry and waits for its interval.
    ///
    /// Returns [`AmqpError::ClientClosing`] as soon as `exit` is cancelled.
    pub async fn wait_for_next_retry(
        &mut self,
        err: &AmqpError,
        event: &str,
        exit: &CancellationToken,
    ) -> Result<(), AmqpError> {
        self.retry_times = self.retry_times.saturating_add(1);
        let interval = (self.policy.interval)(self.retry_times);

        info!(
            key = self.key,
            id = self.id,
            event,
            error = err.to_string(),
            retry_times = self.retry_times,
            "retry will be executed in {:.3} seconds",
            interval.as_secs_f64()
        );

        tokio::select! {
            biased;
            _ = exit.cancelled() => Err(AmqpError::ClientClosing(format!(
                "[{}][{}] trigger shutdown or reconnection mechanism",
                self.key, self.id
            ))),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }
}

/// Classifies `err` as connectivity-related.
///
/// Connectivity errors are the crate's connection/channel/network variants,
/// an `std::io::Error` anywhere in the source chain, or the explicit
/// [`AmqpError::RetryInfinitely`] signal. As a last resort, non-authoritative
/// fallback, any message in the chain mentioning "connection" also counts.
pub fn infinite_retry(err: &AmqpError) -> bool {
    if is_infinite_kind(err) {
        return true;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        if let Some(inner) = cause.downcast_ref::<AmqpError>() {
            if is_infinite_kind(inner) {
                return true;
            }
        }
        source = cause.source();
    }

    mentions_connection(err)
}

fn is_infinite_kind(err: &AmqpError) -> bool {
    matches!(err, AmqpError::RetryInfinitely(_)) || err.is_connectivity()
}

fn mentions_connection(err: &AmqpError) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        if cause.to_string().to_lowercase().contains("connection") {
            return true;
        }
        current = cause.source();
    }
    false
}
