//! Staged processing channel.
//!
//! Decouples stanza arrival from stanza handling: the I/O side submits
//! work without blocking and an elastic pool of workers drains an
//! unbounded queue. The pool keeps `min_workers` alive, grows up to
//! `max_workers` while every worker is busy and shrinks back after
//! `keep_alive` of idleness.
//!
//! A handler failure or panic never takes a worker down. It is logged and
//! the session the work came from is closed.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::error::stream_errors;
use crate::metrics;
use crate::session::Session;
use crate::RouterError;

/// Work that knows which session it came from.
pub trait Originated {
    fn origin(&self) -> Option<Arc<Session>>;
}

/// Processes one item taken off the channel.
#[async_trait]
pub trait ChannelHandler<T>: Send + Sync {
    async fn process(&self, item: T) -> Result<(), RouterError>;
}

/// Queue plus elastic worker pool.
pub struct ProcessingChannel<T> {
    name: String,
    config: ChannelConfig,
    handler: Arc<dyn ChannelHandler<T>>,
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>>,
    queued: AtomicUsize,
    workers: AtomicUsize,
    idle: AtomicUsize,
    worker_count: watch::Sender<usize>,
}

impl<T> ProcessingChannel<T>
where
    T: Originated + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler<T>>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (worker_count, _) = watch::channel(0);
        Arc::new(Self {
            name: name.into(),
            config,
            handler,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            queued: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            worker_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the minimum number of workers.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }
        info!(
            channel = %self.name,
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Processing channel started"
        );
    }

    /// Enqueue `item`. Never waits.
    pub fn submit(self: &Arc<Self>, item: T) -> Result<(), RouterError> {
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = sender.as_ref() else {
                return Err(RouterError::ChannelStopped(self.name.clone()));
            };
            self.queued.fetch_add(1, Ordering::SeqCst);
            if sender.send(item).is_err() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(RouterError::ChannelStopped(self.name.clone()));
            }
        }

        if self.idle.load(Ordering::SeqCst) == 0 {
            self.spawn_worker();
        }
        Ok(())
    }

    /// Stop accepting work. Queued items are still processed.
    pub fn stop(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            info!(channel = %self.name, queued = self.queue_size(), "Processing channel stopping");
        }
    }

    /// Stop and wait until every worker finished.
    pub async fn shutdown(&self) {
        self.stop();
        let mut workers = self.worker_count.subscribe();
        if workers.wait_for(|count| *count == 0).await.is_err() {
            warn!(channel = %self.name, "Worker count watch closed during shutdown");
        }
        info!(channel = %self.name, "Processing channel stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Items waiting for a worker.
    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Live workers.
    pub fn thread_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    fn spawn_worker(self: &Arc<Self>) -> bool {
        let max = self.config.max_workers;
        if self
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return false;
        }
        self.publish_worker_count();
        tokio::spawn(Arc::clone(self).run_worker());
        true
    }

    /// Give up a worker slot if the pool is above its minimum.
    fn try_retire(&self) -> bool {
        let min = self.config.min_workers;
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > min).then(|| n - 1))
            .is_ok()
    }

    /// Spawn a worker for items that arrived while the last idle one was
    /// retiring.
    fn cover_queued_work(self: &Arc<Self>) {
        if self.queue_size() > 0 && self.idle.load(Ordering::SeqCst) == 0 {
            self.spawn_worker();
        }
    }

    fn publish_worker_count(&self) {
        let count = self.thread_count();
        self.worker_count.send_replace(count);
        metrics::record_channel_state(&self.name, self.queue_size(), count);
    }

    async fn run_worker(self: Arc<Self>) {
        let keep_alive = self.config.keep_alive();
        loop {
            self.idle.fetch_add(1, Ordering::SeqCst);
            let next = timeout(keep_alive, async {
                self.receiver.lock().await.recv().await
            })
            .await;
            self.idle.fetch_sub(1, Ordering::SeqCst);

            match next {
                Ok(Some(item)) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.process(item).await;
                }
                Ok(None) => {
                    self.workers.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                Err(_) => {
                    if self.try_retire() {
                        debug!(channel = %self.name, "Idle worker retired");
                        self.publish_worker_count();
                        self.cover_queued_work();
                        return;
                    }
                }
            }
        }
        self.publish_worker_count();
    }

    async fn process(&self, item: T) {
        let origin = item.origin();
        let outcome = AssertUnwindSafe(self.handler.process(item))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        error!(channel = %self.name, error = %failure, "Failed to process item, closing its session");
        if let Some(session) = origin {
            session.close(Some(stream_errors::INTERNAL_SERVER_ERROR));
        }
    }
}

impl<T> fmt::Debug for ProcessingChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingChannel")
            .field("name", &self.name)
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("workers", &self.workers.load(Ordering::Relaxed))
            .finish()
    }
}
