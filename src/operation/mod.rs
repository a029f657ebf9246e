//! Serialized asynchronous operation queues
//!
//! Every stateful object in the runtime (a link document, a story's
//! controller) is mutated by at most one logical step at a time, even though
//! steps arrive both from local API calls and from the synchronized store.
//! The OperationQueue is the primitive enforcing this: it owns a FIFO of
//! operations for one object and drives them strictly one at a time, each
//! running start-to-completion (across any number of await points) before
//! the next one starts. Queues for different objects are fully independent.

use std::future::Future;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A unit of asynchronous work with a single completion signal.
///
/// The future resolving is the completion signal. An operation that kicks
/// off further asynchronous steps must await them (or deliberately detach
/// them) before resolving; sequencing internal steps is what a private
/// sub-queue is for.
pub struct Operation {
    name: &'static str,
    work: BoxFuture<'static, ()>,
}

impl Operation {
    pub fn new(name: &'static str, work: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            name,
            work: Box::pin(work),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A FIFO of operations for one owning object.
///
/// `enqueue` appends; if the queue is idle the operation starts right away,
/// otherwise it starts when the previous one completes. Dropping the queue
/// drops all not-yet-started operations without running them and cancels an
/// in-flight operation at its next suspension point, so operations must
/// hold only weak references to the object that owns the queue and no-op
/// when it is gone.
///
/// An operation may own a private sub-OperationQueue to sequence its own
/// internal steps without blocking siblings in the outer queue; the outer
/// operation completes when its own future resolves, independent of whether
/// the sub-queue has drained.
pub struct OperationQueue {
    label: String,
    tx: mpsc::UnboundedSender<Operation>,
    driver: JoinHandle<()>,
}

impl OperationQueue {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Operation>();

        let driver_label = label.clone();
        let driver = tokio::spawn(async move {
            // One operation at a time, in enqueue order.
            while let Some(op) = rx.recv().await {
                let name = op.name();
                log::trace!("[{}] start {}", driver_label, name);
                op.work.await;
                log::trace!("[{}] done {}", driver_label, name);
            }
        });

        Self { label, tx, driver }
    }

    /// Append an operation. Fire and forget: completion is not observable
    /// through this call.
    pub fn enqueue(&self, name: &'static str, work: impl Future<Output = ()> + Send + 'static) {
        if self.tx.send(Operation::new(name, work)).is_err() {
            log::warn!("[{}] queue destroyed, dropping {}", self.label, name);
        }
    }

    /// Append an operation that produces a value. The receiver resolves when
    /// the operation completes, and yields `Err` if the queue was destroyed
    /// before it ran.
    pub fn run<T, F>(&self, name: &'static str, work: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(name, async move {
            let value = work.await;
            let _ = tx.send(value);
        });
        rx
    }

    /// Resolves once every operation enqueued before this call has fully
    /// completed.
    pub async fn sync(&self) {
        let _ = self.run("OperationQueue::SyncCall", async {}).await;
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
