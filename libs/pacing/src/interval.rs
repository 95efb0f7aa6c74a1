//! Interval and notification driven task loop.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// A unit of periodic work.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Error: fmt::Display + Send;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run once. `ctx` is cancelled when the runner shuts down; long runs
    /// should observe it and return early.
    async fn run(&self, ctx: &CancellationToken) -> Result<(), Self::Error>;
}

/// Create a coalescing notification channel for an [`IntervalRunner`].
pub fn notifier() -> (NotifySender, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (NotifySender { tx }, rx)
}

/// Sending half of [`notifier`].
#[derive(Debug, Clone)]
pub struct NotifySender {
    tx: mpsc::Sender<()>,
}

impl NotifySender {
    /// Request a run. Never blocks; returns false when a request is already
    /// pending or the runner is gone.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Runs a [`Task`] immediately, then on every interval tick and on every
/// notification, until shutdown.
///
/// Runs never overlap. Task errors are logged and the loop continues.
pub struct IntervalRunner<T> {
    task: T,
    interval: Duration,
    notifications: Option<mpsc::Receiver<()>>,
}

impl<T: Task> IntervalRunner<T> {
    /// Create a runner without a notification channel.
    pub fn new(task: T, interval: Duration) -> Self {
        Self {
            task,
            interval,
            notifications: None,
        }
    }

    /// Also run whenever `notifications` yields.
    pub fn with_notifier(mut self, notifications: mpsc::Receiver<()>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Run until `true` is sent on `shutdown` or its sender is dropped.
    ///
    /// On shutdown the task's context is cancelled and an in-flight run is
    /// awaited before returning.
    #[instrument(skip_all, fields(task = %self.task.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            notified = self.notifications.is_some(),
            "Starting interval runner"
        );

        let Self {
            task,
            interval,
            mut notifications,
        } = self;
        let ctx = CancellationToken::new();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial run covers it.
        ticker.tick().await;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let run = task.run(&ctx);
            tokio::pin!(run);

            let stopped = tokio::select! {
                result = &mut run => {
                    report(&task, result);
                    false
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    ctx.cancel();
                    report(&task, run.await);
                    true
                }
            };

            if stopped {
                break;
            }

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
                _ = next_notification(&mut notifications) => {
                    debug!(task = task.name(), "Run requested");
                }
            }
        }

        ctx.cancel();
        info!(task = task.name(), "Interval runner shutting down");
    }
}

fn report<T: Task>(task: &T, result: Result<(), T::Error>) {
    if let Err(e) = result {
        error!(task = task.name(), error = %e, "Task run failed");
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves on the next notification. Once the channel closes it never
/// resolves again.
async fn next_notification(notifications: &mut Option<mpsc::Receiver<()>>) {
    if let Some(rx) = notifications.as_mut() {
        if rx.recv().await.is_some() {
            return;
        }
    }
    *notifications = None;
    std::future::pending::<()>().await
}
