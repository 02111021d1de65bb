use crate::cancellation::{CancellationSignal, CancellationToken};
use anyhow::anyhow;
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The tasks that make up a running node (receivers, port observers, timers)
///
/// All tasks share a single cancellation token, so stopping the group cancels every pending
/// suspension point (ARP waits, retransmission timers, queue reads) at once.
pub struct TaskGroup {
    node_id: Arc<str>,
    token: CancellationToken,
    signal: Option<CancellationSignal>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    // Tasks that panicked before shutdown, already reaped from `tasks`
    failed: Vec<String>,
}

impl TaskGroup {
    pub fn new(node_id: Arc<str>) -> Self {
        let (token, signal) = CancellationToken::new();
        Self {
            node_id,
            token,
            signal: Some(signal),
            tasks: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn spawn(&mut self, name: &'static str, task: impl Future<Output = ()> + Send + 'static) {
        self.reap_finished();
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Number of tasks that may still be running
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Forgets the handles of finished tasks (connections, pending sends), keeping their panics
    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|(_, handle)| handle.is_finished());
        self.tasks = running;

        for (name, handle) in finished {
            if let Some(Err(e)) = handle.now_or_never() {
                self.failed.push(format!("{name} ({e})"));
            }
        }
    }

    /// Cancels all tasks and waits for them to finish
    ///
    /// Every task is awaited, even if some of them panicked. The returned error lists all the
    /// tasks that did not finish cleanly.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(signal) = self.signal.take() {
            signal.cancel();
        }

        let mut failed = std::mem::take(&mut self.failed);
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                failed.push(format!("{name} ({e})"));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "tasks of node `{}` did not shut down cleanly: {}",
                self.node_id,
                failed.join(", ")
            ))
        }
    }
}
