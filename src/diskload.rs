//! Disk-load worker pool
//!
//! Cache misses are served by blocking file reads on a fixed set of worker
//! threads so the control thread never touches the disk for low-priority
//! requests. Jobs are closures that perform the read and hand their result
//! back to the engine over a channel; the pool itself never sees cache state.
//!
//! `drain()` discards everything still queued and blocks until running jobs
//! finish. Discarded jobs never run, so no completion is delivered for them.
//! This is what cancel-all and catalog replacement rely on.

use crate::error::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Tagged {
    epoch: u64,
    job: Job,
}

struct State {
    epoch: u64,
    /// jobs queued or running that have not yet finished or been discarded
    active: usize,
}

struct Shared {
    state: Mutex<State>,
    done: Condvar,
}

pub struct DiskLoadPool {
    tx: Option<Sender<Tagged>>,
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DiskLoadPool {
    /// Default sizing: three workers per available core, since the jobs are
    /// I/O bound and mostly parked in the kernel.
    pub fn with_default_size() -> Result<Self> {
        let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
        DiskLoadPool::new(parallelism * 3)
    }

    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Tagged>();
        let shared = Arc::new(Shared {
            state: Mutex::new(State { epoch: 0, active: 0 }),
            done: Condvar::new(),
        });

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("diskload-{i}"))
                    .spawn(move || worker_loop(rx, shared))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(workers = handles.len(), "disk load pool started");
        Ok(DiskLoadPool {
            tx: Some(tx),
            shared,
            workers: handles,
        })
    }

    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        let epoch = {
            let mut state = self.shared.state.lock();
            state.active += 1;
            state.epoch
        };
        if let Some(tx) = &self.tx {
            if tx
                .send(Tagged {
                    epoch,
                    job: Box::new(job),
                })
                .is_err()
            {
                // pool already shut down; undo the accounting
                let mut state = self.shared.state.lock();
                state.active -= 1;
            }
        }
    }

    /// Discard all queued jobs and block until running ones finish.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        while state.active > 0 {
            self.shared.done.wait(&mut state);
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().active
    }
}

impl Drop for DiskLoadPool {
    fn drop(&mut self) {
        self.tx = None; // closes the channel, workers exit after the backlog
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Tagged>, shared: Arc<Shared>) {
    while let Ok(tagged) = rx.recv() {
        let discard = {
            let state = shared.state.lock();
            tagged.epoch != state.epoch
        };
        if !discard {
            (tagged.job)();
        }
        let mut state = shared.state.lock();
        state.active -= 1;
        if state.active == 0 {
            shared.done.notify_all();
        }
    }
}
