// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reconnect monitor shared by consumers and producers.
//!
//! The monitor waits for a close/cancel notification of the current session
//! and then drives the owner through `recover()` until it succeeds or the
//! owner's exit token is cancelled. It holds only a weak reference, so an
//! engine dropped without `close()` still lets its monitor finish.

use crate::{errors::AmqpError, transport::Notification};
use async_trait::async_trait;
use std::{
    sync::Weak,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Pause between two failed recoveries.
pub(crate) const RECOVER_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub(crate) trait Recoverable: Send + Sync + 'static {
    fn module(&self) -> &'static str;

    fn key(&self) -> &str;

    fn id(&self) -> u32;

    /// Notification stream of the session currently in use.
    async fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>>;

    /// Rebuilds the session; a no-op once shutdown has started.
    async fn recover(&self) -> Result<(), AmqpError>;
}

pub(crate) fn spawn<T: Recoverable>(target: Weak<T>, exit: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(target, exit))
}

async fn run<T: Recoverable>(target: Weak<T>, exit: CancellationToken) {
    if let Some(owner) = target.upgrade() {
        info!(module = owner.module(), key = owner.key(), id = owner.id(), "monitor start");
    }

    loop {
        let notifications = match target.upgrade() {
            Some(owner) => owner.take_notifications().await,
            None => return,
        };

        let notification = match notifications {
            Some(mut rx) => tokio::select! {
                biased;
                _ = exit.cancelled() => None,
                n = rx.recv() => Some(n),
            },
            None => {
                exit.cancelled().await;
                None
            }
        };

        let Some(notification) = notification else {
            if let Some(owner) = target.upgrade() {
                info!(module = owner.module(), key = owner.key(), id = owner.id(), "monitor go to exit");
            }
            return;
        };

        {
            let Some(owner) = target.upgrade() else {
                return;
            };
            let (module, key, id) = (owner.module(), owner.key(), owner.id());
            match notification {
                Some(Notification::ConnectionClosed(reason)) => {
                    info!(module, key, id, reason, "connection closed")
                }
                Some(Notification::ChannelClosed(reason)) => {
                    info!(module, key, id, reason, "channel closed")
                }
                Some(Notification::ConsumerCancelled(reason)) => {
                    info!(module, key, id, reason, "consumer cancelled by the broker")
                }
                None => info!(module, key, id, "notification stream closed"),
            }
        }

        if !recover_until_success(&target, &exit).await {
            return;
        }
    }
}

/// Returns `false` when the monitor should stop.
async fn recover_until_success<T: Recoverable>(target: &Weak<T>, exit: &CancellationToken) -> bool {
    let mut times: u64 = 1;
    loop {
        if exit.is_cancelled() {
            return false;
        }
        let Some(owner) = target.upgrade() else {
            return false;
        };

        match owner.recover().await {
            Ok(()) => return true,
            Err(err) => {
                error!(
                    module = owner.module(),
                    key = owner.key(),
                    id = owner.id(),
                    error = err.to_string(),
                    retry_times = times,
                    "recover fail..."
                );
                times += 1;
            }
        }
        drop(owner);

        tokio::select! {
            biased;
            _ = exit.cancelled() => {
                return false;
            }
            _ = tokio::time::sleep(RECOVER_INTERVAL) => {}
        }
    }
}
