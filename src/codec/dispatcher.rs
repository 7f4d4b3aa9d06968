use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs jobs one at a time in submission order, regardless of which task submitted them. A
///  panicking job is logged and does not affect subsequent jobs.
pub struct SequentialDispatcher {
    queue: mpsc::UnboundedSender<Job>,
}

impl SequentialDispatcher {
    /// NB: must be called from inside a tokio runtime
    pub fn new() -> SequentialDispatcher {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        SequentialDispatcher { queue }
    }

    /// Returns `false` if the dispatcher's task is gone
    pub fn dispatch(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        self.queue.send(Box::pin(job)).is_ok()
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = tokio::spawn(job).await {
            if e.is_panic() {
                warn!("dispatched job panicked - continuing with the next one");
            }
        }
    }
    debug!("dispatcher shut down");
}
