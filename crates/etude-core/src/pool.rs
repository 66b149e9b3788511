// src/pool.rs
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// Fixed set of worker threads draining one FIFO queue.
///
/// The closed flag lives under the queue lock, so a worker can never miss
/// shutdown between checking the queue and blocking on the condvar.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let shared = pool.shared.clone();
            // on error `pool` drops here and joins the threads already started
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || worker_loop(i, &shared))?;
            pool.handles.push(handle);
        }
        debug!(threads, "worker pool started");
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue `task` and wake one idle worker. Returns `false` once the pool
    /// is shut down; the task is dropped unrun.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
        true
    }

    pub fn queued(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Close the queue, discard pending tasks and join every worker.
    /// A task already running finishes first.
    pub fn shutdown(&mut self) {
        let dropped = {
            let mut queue = self.lock();
            queue.closed = true;
            std::mem::take(&mut queue.tasks)
        };
        self.shared.cond.notify_all();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "discarding queued tasks");
        }
        drop(dropped);

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                if queue.closed {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = shared
                    .cond
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        run_task(id, task);
    }
}

#[cfg(feature = "catch-panic")]
fn run_task(id: usize, task: Task) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
        error!(worker = id, "task panicked");
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_task(_id: usize, task: Task) {
    task();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_task_exactly_once() {
        const N: usize = 2000;
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());
        let (tx, rx) = mpsc::channel();

        let submitters: Vec<_> = (0..4)
            .map(|s| {
                let pool = pool.clone();
                let seen = seen.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in (s..N).step_by(4) {
                        let seen = seen.clone();
                        let tx = tx.clone();
                        assert!(pool.execute(move || {
                            seen[i].fetch_add(1, Ordering::SeqCst);
                            tx.send(()).unwrap();
                        }));
                    }
                })
            })
            .collect();
        for s in submitters {
            s.join().unwrap();
        }
        drop(tx);

        for _ in 0..N {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert!(seen.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn single_worker_keeps_fifo_order() {
        let pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let order = order.clone();
            let tx = tx.clone();
            pool.execute(move || {
                order.lock().unwrap().push(i);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_rejects_new_tasks_and_joins() {
        let mut pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
        assert!(!pool.execute(|| {}));
    }

    #[test]
    fn shutdown_discards_queued_tasks() {
        let mut pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..5 {
            let ran = ran.clone();
            pool.execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(pool.queued(), 5);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        pool.shutdown();
        releaser.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(|| panic!("boom"));
        pool.execute(move || tx.send(7).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
