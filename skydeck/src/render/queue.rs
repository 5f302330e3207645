//! Serialized draw-job queue.
//!
//! One worker thread (`skydeck-draw`) owns the [`Renderer`] and runs jobs
//! strictly in enqueue order, one at a time. Producers never block: the
//! channel is unbounded.
//!
//! Every job carries the queue generation current at enqueue time.
//! [`DrawQueue::invalidate`] bumps the generation, so jobs still queued from
//! before (an old page, a stopped task) are dropped instead of drawn.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::{RenderError, Renderer, SurfaceId};
use crate::trace::{debug, info, trace, warn};

/// One queued paint operation.
pub type DrawJob<C> = Box<dyn FnOnce(&mut C) + Send>;

enum Message<C> {
    Draw {
        generation: u64,
        surface: SurfaceId,
        job: DrawJob<C>,
    },
    /// Acknowledged once every earlier message has been handled.
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    drawn: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
}

/// Worker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Jobs painted successfully.
    pub drawn: u64,
    /// Jobs dropped because their generation was invalidated.
    pub stale: u64,
    /// Jobs whose renderer call failed.
    pub failed: u64,
}

/// Handle to the draw worker.
pub struct DrawQueue<R: Renderer> {
    tx: Sender<Message<R::Context>>,
    generation: Arc<AtomicU64>,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<R>>,
}

impl<R: Renderer> DrawQueue<R> {
    /// Moves `renderer` onto a new worker thread.
    ///
    /// # Errors
    ///
    /// [`RenderError::Io`] if the thread can't be spawned.
    pub fn spawn(renderer: R) -> Result<Self, RenderError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let generation = Arc::new(AtomicU64::new(0));
        let counters = Arc::new(Counters::default());

        let worker = {
            let generation = Arc::clone(&generation);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("skydeck-draw".into())
                .spawn(move || {
                    debug!("draw worker started");
                    let renderer = run_worker(renderer, &rx, &generation, &counters);
                    debug!("draw worker exiting");
                    renderer
                })?
        };

        Ok(Self {
            tx,
            generation,
            counters,
            worker: Some(worker),
        })
    }

    /// Queues `job` for `surface` under the current generation.
    ///
    /// Returns `false` if the worker is gone.
    pub fn enqueue(
        &self,
        surface: SurfaceId,
        job: impl FnOnce(&mut R::Context) + Send + 'static,
    ) -> bool {
        let message = Message::Draw {
            generation: self.generation.load(Ordering::Acquire),
            surface,
            job: Box::new(job),
        };
        self.tx.send(message).is_ok()
    }

    /// Drops every job queued so far. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Blocks until every job enqueued before this call has been handled.
    ///
    /// Returns `false` if the worker is gone.
    pub fn flush(&self) -> bool {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Message::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.recv().is_ok()
    }

    #[must_use]
    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            drawn: self.counters.drawn.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs every queued job, closes the renderer and hands it back.
    ///
    /// Returns `None` if the worker panicked.
    pub fn shutdown(mut self) -> Option<R> {
        let _ = self.tx.send(Message::Shutdown);
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(renderer) => Some(renderer),
            Err(_) => {
                warn!("draw worker panicked");
                None
            }
        }
    }
}

impl<R: Renderer> Drop for DrawQueue<R> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Message::Shutdown);
            let _ = worker.join();
        }
    }
}

fn run_worker<R: Renderer>(
    mut renderer: R,
    rx: &Receiver<Message<R::Context>>,
    generation: &AtomicU64,
    counters: &Counters,
) -> R {
    for message in rx {
        match message {
            Message::Draw {
                generation: queued_at,
                surface,
                job,
            } => {
                if queued_at != generation.load(Ordering::Acquire) {
                    counters.stale.fetch_add(1, Ordering::Relaxed);
                    trace!(surface = %surface, "dropping stale draw job");
                    continue;
                }
                let mut job = Some(job);
                let result = renderer.draw(surface, &mut |ctx| {
                    if let Some(job) = job.take() {
                        job(ctx);
                    }
                });
                match result {
                    Ok(()) => {
                        counters.drawn.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(surface = %surface, error = %_e, "draw failed");
                    }
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Shutdown => break,
        }
    }

    if let Err(_e) = renderer.close() {
        warn!(error = %_e, "renderer close failed");
    }
    info!("renderer closed");
    renderer
}
