use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Fixed set of backend handles shared by worker threads.
///
/// Checking out blocks while every handle is in use; a [`PooledConn`]
/// returns its handle on drop.
pub struct ConnPool<T> {
    idle: Mutex<Vec<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> ConnPool<T> {
    pub fn new(conns: Vec<T>) -> Self {
        let capacity = conns.len();
        Self {
            idle: Mutex::new(conns),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn get(&self) -> PooledConn<'_, T> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConn {
                    pool: self,
                    conn: Some(conn),
                };
            }
            idle = self
                .available
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<PooledConn<'_, T>> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut idle, _) = self
            .available
            .wait_timeout_while(idle, timeout, |idle| idle.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        idle.pop().map(|conn| PooledConn {
            pool: self,
            conn: Some(conn),
        })
    }

    pub fn free_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn put_back(&self, conn: T) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
        self.available.notify_one();
    }
}

pub struct PooledConn<'a, T> {
    pool: &'a ConnPool<T>,
    conn: Option<T>,
}

impl<T> Deref for PooledConn<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only `Drop` takes the handle
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PooledConn<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PooledConn<'_, T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn handles_return_on_drop() {
        let pool = ConnPool::new(vec![1, 2]);
        assert_eq!(pool.free_count(), 2);
        {
            let a = pool.get();
            let b = pool.get();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.free_count(), 0);
            assert!(pool.get_timeout(Duration::from_millis(10)).is_none());
        }
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn checkout_never_exceeds_capacity() {
        let pool = Arc::new(ConnPool::new(vec![(); 3]));
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _conn = pool.get();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.free_count(), 3);
    }
}
