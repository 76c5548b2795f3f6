//! Thread-isolated producer: owns its own Tokio runtime on a dedicated OS
//! thread, a bounded publish queue, and a push task that dequeues with a
//! short poll timeout so shutdown is prompt.
//!
//! Grounded on the original's `ThreadedProducer(ServiceThread)`, which
//! owns its own event loop; this is the one auxiliary OS thread the
//! concurrency model allows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::callbacks::WorkerCallbacks;
use crate::config::ProducerConfig;
use crate::error::{Result, TransportError};
use crate::producer::Producer;
use crate::types::PendingMessage;

const QUEUE_CAPACITY: usize = 1024;
/// Short enough that shutdown is prompt, matching the original's 0.1s
/// poll timeout on its event queue.
const DEQUEUE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

enum Command {
    Publish(PendingMessage, oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<Result<()>>),
}

/// A handle to a producer running on its own thread with its own runtime.
/// Cloning the handle is cheap; only one background thread is ever
/// spawned per handle.
#[derive(Clone)]
pub struct ThreadedProducerHandle {
    sender: mpsc::Sender<Command>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ThreadedProducerHandle {
    /// Spawns the dedicated thread and its runtime, constructs the
    /// underlying `Producer` on it, and returns a handle immediately.
    pub fn spawn(config: ProducerConfig, callbacks: Arc<dyn WorkerCallbacks>) -> Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<Command>(QUEUE_CAPACITY);
        let shutdown_initiated = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown_initiated.clone();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("kafka-threaded-producer".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(TransportError::NotReady(err.to_string())));
                        return;
                    }
                };

                let producer = match Producer::new(&config) {
                    Ok(producer) => producer,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                producer.start();
                let _ = ready_tx.send(Ok(()));

                runtime.block_on(async move {
                    let mut queue_size: usize = 0;
                    loop {
                        if thread_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        match tokio::time::timeout(DEQUEUE_POLL_TIMEOUT, receiver.recv()).await {
                            Ok(Some(Command::Publish(message, reply))) => {
                                queue_size = queue_size.saturating_sub(1);
                                callbacks.on_produce_message(&message);
                                let result = producer.send_and_wait(message).await.map(|_| ());
                                let _ = reply.send(result);
                                callbacks.on_threaded_producer_buffer_processed(queue_size);
                            }
                            Ok(Some(Command::Flush(reply))) => {
                                let result = producer.flush(Duration::from_secs(30));
                                let _ = reply.send(result);
                            }
                            Ok(None) => break,
                            Err(_elapsed) => continue,
                        }
                    }
                    // Drain remaining messages before stopping.
                    while let Ok(Command::Publish(_message, reply)) = receiver.try_recv() {
                        let _ = reply.send(Err(TransportError::ConsumerStopped));
                    }
                    let _ = producer.flush(Duration::from_secs(30));
                    producer.stop();
                    info!("threaded producer stopped");
                });
            })
            .map_err(|err| TransportError::NotReady(format!("failed to spawn producer thread: {err}")))?;

        ready_rx
            .recv()
            .map_err(|_| TransportError::NotReady("producer thread exited before starting".into()))??;

        Ok(ThreadedProducerHandle {
            sender,
            shutdown_initiated,
        })
    }

    pub async fn publish(&self, message: PendingMessage) -> Result<()> {
        if self.shutdown_initiated.load(Ordering::SeqCst) {
            return Err(TransportError::ConsumerStopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Publish(message, reply_tx))
            .await
            .map_err(|_| TransportError::ConsumerStopped)?;
        reply_rx.await.map_err(|_| TransportError::ConsumerStopped)?
    }

    /// Drains the queue synchronously, then flushes the underlying
    /// producer's buffer.
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| TransportError::ConsumerStopped)?;
        reply_rx.await.map_err(|_| TransportError::ConsumerStopped)?
    }

    /// Latches so shutdown only ever executes once, even if called
    /// concurrently.
    pub fn stop(&self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("threaded producer shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_latched_to_single_execution() {
        let shutdown_initiated = Arc::new(AtomicBool::new(false));
        assert!(!shutdown_initiated.swap(true, Ordering::SeqCst));
        assert!(shutdown_initiated.swap(true, Ordering::SeqCst));
    }
}
