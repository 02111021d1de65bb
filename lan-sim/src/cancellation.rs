use futures::{FutureExt, select_biased};
use tokio::sync::watch;

/// The "node is stopping" flag, shared by every task of a running node
#[derive(Clone)]
pub struct CancellationToken {
    stopping: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> (Self, CancellationSignal) {
        let (stop, stopping) = watch::channel(false);
        (Self { stopping }, CancellationSignal { stop })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once the signal fires; never resolves if the signal is dropped without firing
    pub async fn cancelled(&self) {
        let mut stopping = self.stopping.clone();
        if stopping.wait_for(|stopping| *stopping).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }

    /// Drives `future` to completion, unless the token is cancelled first (in which case `None`
    /// is returned and the future is dropped)
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        select_biased! {
            _ = self.cancelled().fuse() => None,
            output = future.fuse() => Some(output),
        }
    }
}

/// Owned by whoever stops the node
pub struct CancellationSignal {
    stop: watch::Sender<bool>,
}

impl CancellationSignal {
    pub fn cancel(self) {
        self.stop.send_replace(true);
    }
}
