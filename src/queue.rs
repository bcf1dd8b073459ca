use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{ForgeciError, Result};
use crate::store::JobId;

/// Create the bounded work queue connecting dispatch to the worker pool.
///
/// Delivery is at-least-once from the consumer's point of view: the
/// supervisor re-enqueues stale jobs, so a worker may see the same job id
/// more than once and must check current descriptor state before acting.
pub fn work_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueSender { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<JobId>,
}

impl QueueSender {
    /// Non-blocking enqueue; the dispatch path never waits on queue space.
    pub fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.tx.try_send(job_id).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ForgeciError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                ForgeciError::Internal("work queue receiver dropped".into())
            }
        })
    }
}

/// Receiver half shared by all workers in the pool.
#[derive(Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
}

impl QueueReceiver {
    /// Next job id, or `None` once all senders are gone.
    pub async fn recv(&self) -> Option<JobId> {
        self.rx.lock().await.recv().await
    }
}
