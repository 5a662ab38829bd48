//! Destination execution streams.
//!
//! Every destination rank gets one dedicated stream (`emx-stream-{rank}`).
//! Work submitted to a stream runs in submission order; different streams
//! run concurrently. Submission returns an [`Awaitable`] handle — the
//! value cannot be read without an explicit `wait()`, which is where the
//! orchestrator pins its cross-stage data dependencies.
//!
//! 스트림 경계를 넘는 버퍼는 소비하는 스트림에 등록해야 한다
//! ([`DeviceStream::record_buffer`]): 등록된 버퍼는 해당 스트림이
//! synchronize될 때까지 살아있다.

use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EmxError, EmxResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A value produced asynchronously on a destination stream.
///
/// Reading requires an explicit [`Awaitable::wait`]; dropping an
/// unawaited handle abandons the result but never the work.
#[must_use = "stream results must be waited on before use"]
pub enum Awaitable<T> {
    /// Produced synchronously (no stream hop was needed).
    Ready(EmxResult<T>),
    /// Pending on a stream.
    Pending(Receiver<EmxResult<T>>),
}

impl<T> Awaitable<T> {
    pub fn ready(value: T) -> Self {
        Awaitable::Ready(Ok(value))
    }

    /// Block until the producing stream has delivered the value.
    pub fn wait(self) -> EmxResult<T> {
        match self {
            Awaitable::Ready(value) => value,
            Awaitable::Pending(rx) => rx.recv().map_err(|_| {
                EmxError::Transport("stream dropped result before delivery".to_string())
            })?,
        }
    }
}

struct StreamShared {
    /// Buffers handed off from another stream; released on synchronize.
    retained: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

/// One destination's in-order execution queue.
pub struct DeviceStream {
    rank: usize,
    tx: Sender<Job>,
    shared: Arc<StreamShared>,
}

impl DeviceStream {
    /// Queue work on this stream. The closure runs after everything
    /// submitted before it.
    pub fn submit<T, F>(&self, f: F) -> Awaitable<T>
    where
        T: Send + 'static,
        F: FnOnce() -> EmxResult<T> + Send + 'static,
    {
        let (result_tx, result_rx) = channel();
        let job: Job = Box::new(move || {
            // Receiver may be gone if the caller abandoned the handle.
            let _ = result_tx.send(f());
        });
        if self.tx.send(job).is_err() {
            return Awaitable::Ready(Err(EmxError::Transport(format!(
                "stream {} is shut down",
                self.rank
            ))));
        }
        Awaitable::Pending(result_rx)
    }

    /// Register a buffer that this stream consumes but did not allocate.
    /// The stream keeps it alive until the next [`DeviceStream::synchronize`].
    pub fn record_buffer(&self, buffer: Arc<dyn Any + Send + Sync>) {
        self.shared.retained.lock().push(buffer);
    }

    /// Wait for all queued work to finish, then release retained buffers.
    pub fn synchronize(&self) -> EmxResult<()> {
        let shared = Arc::clone(&self.shared);
        self.submit(move || {
            shared.retained.lock().clear();
            Ok(())
        })
        .wait()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

struct StreamWorker {
    tx: Sender<Job>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

/// One execution stream per destination rank.
///
/// The pool is the process-local stand-in for the distributed transport:
/// distributors grab per-destination streams at construction time and
/// never interpret anything beyond "queue work on rank r".
pub struct StreamPool {
    workers: Vec<StreamWorker>,
}

impl StreamPool {
    pub fn new(world_size: usize) -> Self {
        let mut workers = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let (tx, rx) = channel::<Job>();
            let handle = std::thread::Builder::new()
                .name(format!("emx-stream-{}", rank))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(rank, "stream worker shut down");
                })
                .expect("failed to spawn stream worker");
            workers.push(StreamWorker {
                tx,
                handle: Some(handle),
                shared: Arc::new(StreamShared {
                    retained: Mutex::new(Vec::new()),
                }),
            });
        }
        Self { workers }
    }

    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    pub fn stream(&self, rank: usize) -> EmxResult<DeviceStream> {
        let worker = self.workers.get(rank).ok_or_else(|| {
            EmxError::Transport(format!(
                "rank {} outside world of size {}",
                rank,
                self.workers.len()
            ))
        })?;
        Ok(DeviceStream {
            rank,
            tx: worker.tx.clone(),
            shared: Arc::clone(&worker.shared),
        })
    }

    /// Synchronize every stream (barrier for tests and shutdown paths).
    pub fn synchronize_all(&self) -> EmxResult<()> {
        for rank in 0..self.workers.len() {
            self.stream(rank)?.synchronize()?;
        }
        Ok(())
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Closing the channel lets the worker drain and exit.
            let (closed_tx, _) = channel::<Job>();
            let tx = std::mem::replace(&mut worker.tx, closed_tx);
            drop(tx);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Routing metadata that outlives the call that created it must be
/// attached to the consuming execution stream, not to the allocation
/// scope that produced it.
pub trait StreamAttached {
    fn record_stream(&self, stream: &DeviceStream);
}
