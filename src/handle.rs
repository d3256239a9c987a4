use tokio::task::JoinHandle;

/// Poller task that cannot outlive its handle.
///
/// Aborting an already finished task is a no-op, so dropping after a
/// completed [`join`](Self::join) is harmless.
pub(crate) struct PollerTask(JoinHandle<()>);

impl PollerTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    /// Resolves when the task ends. Dropping this future aborts the task.
    pub async fn join(mut self) {
        let _ = (&mut self.0).await;
    }
}

impl Drop for PollerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
