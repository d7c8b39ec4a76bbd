//! Background sync scheduling: periodic timer, change debounce and reconnects

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::driver::SyncDriver;
use super::store::KeyValueStore;
use super::transport::SyncTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    ChangeQueued,
    CameOnline,
    Shutdown,
}

/// Running scheduler task
#[derive(Debug)]
pub struct SchedulerHandle {
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the scheduler to exit after `SyncDriver::stop`
    pub async fn join(self) {
        if let Err(error) = self.task.await {
            tracing::warn!(%error, "Sync scheduler task ended abnormally");
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T: SyncTransport, S: KeyValueStore> SyncDriver<T, S> {
    /// Spawn the scheduler on the current tokio runtime.
    ///
    /// Starting again replaces the previous scheduler, which exits once its
    /// signal channel closes.
    pub fn start(&self) -> SchedulerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.install_signals(Some(sender));
        let driver = self.clone();
        let task = tokio::spawn(async move { driver.schedule(receiver).await });
        SchedulerHandle { task }
    }

    /// Ask the scheduler to exit; an in-flight cycle runs to completion
    pub fn stop(&self) {
        self.signal(Signal::Shutdown);
        self.install_signals(None);
    }

    async fn schedule(self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        let period = self.config().sync_interval;
        let debounce = self.config().debounce;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let quiet = time::sleep(debounce);
        tokio::pin!(quiet);
        let mut armed = false;

        tracing::debug!(
            interval_secs = period.as_secs(),
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_scheduled("interval").await,
                () = &mut quiet, if armed => {
                    armed = false;
                    self.run_scheduled("debounce").await;
                }
                signal = signals.recv() => match signal {
                    Some(Signal::ChangeQueued) => {
                        quiet.as_mut().reset(Instant::now() + debounce);
                        armed = true;
                    }
                    Some(Signal::CameOnline) => self.run_scheduled("online").await,
                    Some(Signal::Shutdown) | None => break,
                },
            }
        }

        tracing::debug!("Sync scheduler stopped");
    }

    async fn run_scheduled(&self, reason: &'static str) {
        match self.trigger_sync().await {
            Ok(report) => tracing::debug!(
                reason,
                pulled = report.pulled,
                pushed = report.pushed,
                conflicts = report.conflicts,
                "Scheduled sync completed"
            ),
            Err(error) if error.is_busy() => {
                tracing::debug!(reason, %error, "Scheduled sync skipped");
            }
            Err(error) => tracing::warn!(reason, %error, "Scheduled sync failed"),
        }
    }
}
