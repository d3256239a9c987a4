//! In-process trigger that drives a [`JobEngine`] on a fixed interval.

use tracing::instrument;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::{engine::JobEngine, handle::PollerTask, repo::JobRepo};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct JobPoller<R: JobRepo> {
    engine: Arc<JobEngine<R>>,
    poll_interval: Duration,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub(crate) struct JobPollerHandle {
    handle: Mutex<Option<PollerTask>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    shutdown_called: AtomicBool,
}

impl<R: JobRepo> JobPoller<R> {
    pub fn new(engine: Arc<JobEngine<R>>, poll_interval: Duration) -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        Self {
            engine,
            poll_interval,
            shutdown_tx,
        }
    }

    pub fn start(self) -> JobPollerHandle {
        let shutdown_tx = self.shutdown_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = PollerTask::spawn(self.main_loop(shutdown_rx));
        JobPollerHandle {
            handle: Mutex::new(Some(handle)),
            shutdown_tx,
            shutdown_called: AtomicBool::new(false),
        }
    }

    async fn main_loop(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        if let Err(e) = self.engine.run_startup_pass().await {
            tracing::error!(error = %e, "startup pass failed");
        }

        let mut failures = 0u32;
        loop {
            let pause = match failures {
                0 => self.poll_interval,
                n => self
                    .poll_interval
                    .max(Duration::from_millis(50 << n.min(10))),
            };
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            match self.engine.run_recurring_pass().await {
                Ok(summary) => {
                    failures = 0;
                    tracing::debug!(
                        n_scheduled = summary.schedule.scheduled,
                        n_executed = summary.run.executed(),
                        "recurring pass finished"
                    );
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(error = %e, failures, "recurring pass failed");
                }
            }
        }
    }
}

impl JobPollerHandle {
    /// Stops the poller after its current pass.
    ///
    /// Idempotent. A pass still running after a short grace period is aborted;
    /// its open transaction rolls back and the record becomes selectable again.
    #[instrument(name = "durable_jobs.poller.shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handle = self
            .handle
            .lock()
            .expect("Couldn't lock poller handle Mutex")
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.join())
                .await
                .is_err()
            {
                tracing::warn!("poller did not stop in time, aborting");
            }
        }
    }
}

impl Drop for JobPollerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
