// src/timer.rs
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type ExpireFn = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: usize,
    expires: Instant,
    on_expire: ExpireFn,
}

/// Binary min-heap of deadlines keyed by connection id.
///
/// `index` maps each id to its heap slot so a lease can be extended or
/// cancelled in O(log n). Every mutation keeps `index[heap[i].id] == i`.
#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<usize, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedule `on_expire` to run `ttl` from now. Re-adding a live id
    /// replaces both its deadline and its callback.
    pub fn add<F>(&mut self, id: usize, ttl: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_at(id, Instant::now() + ttl, Box::new(on_expire));
    }

    fn add_at(&mut self, id: usize, expires: Instant, on_expire: ExpireFn) {
        match self.index.get(&id).copied() {
            Some(slot) => {
                self.heap[slot].expires = expires;
                self.heap[slot].on_expire = on_expire;
                self.restore(slot);
            }
            None => {
                let slot = self.heap.len();
                self.heap.push(TimerNode {
                    id,
                    expires,
                    on_expire,
                });
                self.index.insert(id, slot);
                self.sift_up(slot);
            }
        }
    }

    /// Move `id`'s deadline to `ttl` from now. Returns `false` for unknown ids.
    pub fn adjust(&mut self, id: usize, ttl: Duration) -> bool {
        let Some(&slot) = self.index.get(&id) else {
            return false;
        };
        self.heap[slot].expires = Instant::now() + ttl;
        self.restore(slot);
        true
    }

    /// Cancel `id` without running its callback.
    pub fn remove(&mut self, id: usize) -> bool {
        match self.index.get(&id).copied() {
            Some(slot) => {
                self.delete(slot);
                true
            }
            None => false,
        }
    }

    /// Run `id`'s callback now and drop the entry.
    pub fn fire(&mut self, id: usize) -> bool {
        match self.index.get(&id).copied() {
            Some(slot) => {
                let node = self.delete(slot);
                (node.on_expire)();
                true
            }
            None => false,
        }
    }

    /// Remove the earliest deadline without running its callback.
    pub fn pop(&mut self) -> Option<(usize, Instant)> {
        if self.heap.is_empty() {
            return None;
        }
        let node = self.delete(0);
        Some((node.id, node.expires))
    }

    pub fn peek(&self) -> Option<(usize, Instant)> {
        self.heap.first().map(|n| (n.id, n.expires))
    }

    /// Fire every entry due at or before now.
    pub fn do_work(&mut self) -> usize {
        self.expire_until(Instant::now())
    }

    /// Fire every entry due at or before `now`, earliest first.
    pub fn expire_until(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(first) = self.heap.first() {
            if first.expires > now {
                break;
            }
            let node = self.delete(0);
            (node.on_expire)();
            fired += 1;
        }
        fired
    }

    /// Expire what is due, then report the wait until the next deadline.
    /// `None` means no timers are pending.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.do_work();
        self.heap
            .first()
            .map(|n| n.expires.saturating_duration_since(Instant::now()))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn delete(&mut self, slot: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if slot != last {
            self.swap_nodes(slot, last);
        }
        let node = self.heap.pop().unwrap_or_else(|| unreachable!());
        self.index.remove(&node.id);
        if slot < self.heap.len() {
            self.restore(slot);
        }
        node
    }

    fn restore(&mut self, slot: usize) {
        if !self.sift_down(slot) {
            self.sift_up(slot);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn check_invariants(timer: &TimerHeap) {
        assert_eq!(timer.heap.len(), timer.index.len());
        for (i, node) in timer.heap.iter().enumerate() {
            assert_eq!(timer.index[&node.id], i);
            if i > 0 {
                assert!(timer.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> ExpireFn) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move || -> ExpireFn {
            let h = h.clone();
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn adjust_moves_deadline_later() {
        let mut timer = TimerHeap::new();
        timer.add(1, Duration::from_millis(100), || {});
        timer.adjust(1, Duration::from_millis(500));

        let tick = timer.next_tick().unwrap();
        assert!(tick > Duration::from_millis(400), "{:?}", tick);
        assert!(tick <= Duration::from_millis(500));
    }

    #[test]
    fn expired_callback_runs_once() {
        let (hits, cb) = counter();
        let mut timer = TimerHeap::new();
        timer.add_at(7, Instant::now(), cb());

        let later = Instant::now() + Duration::from_millis(1);
        assert_eq!(timer.expire_until(later), 1);
        assert_eq!(timer.expire_until(later), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.contains(7));
        assert!(timer.is_empty());
    }

    #[test]
    fn removed_entry_never_fires() {
        let (hits, cb) = counter();
        let mut timer = TimerHeap::new();
        let base = Instant::now();
        for id in 0..10 {
            timer.add_at(id, base + Duration::from_millis(id as u64), cb());
        }
        assert!(timer.remove(3));
        assert!(!timer.remove(3));
        check_invariants(&timer);

        timer.expire_until(base + Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn fires_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut timer = TimerHeap::new();
        let base = Instant::now();
        for (id, ms) in [(1, 50u64), (2, 10), (3, 30), (4, 20), (5, 40)] {
            let order = order.clone();
            timer.add_at(
                id,
                base + Duration::from_millis(ms),
                Box::new(move || order.lock().unwrap().push(id)),
            );
        }
        timer.expire_until(base + Duration::from_millis(35));
        assert_eq!(*order.lock().unwrap(), vec![2, 4, 3]);
        assert_eq!(timer.peek().map(|(id, _)| id), Some(5));
    }

    #[test]
    fn pop_fire_and_readd() {
        let (hits, cb) = counter();
        let mut timer = TimerHeap::new();
        let base = Instant::now() + Duration::from_secs(10);
        timer.add_at(1, base, cb());
        timer.add_at(2, base + Duration::from_secs(1), cb());

        // re-adding replaces instead of duplicating
        timer.add_at(1, base + Duration::from_secs(2), cb());
        assert_eq!(timer.len(), 2);
        assert_eq!(timer.pop().map(|(id, _)| id), Some(2));

        assert!(timer.fire(1));
        assert!(!timer.fire(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.pop(), None);
        assert_eq!(timer.next_tick(), None);
    }

    #[test]
    fn index_survives_random_churn() {
        let mut timer = TimerHeap::new();
        let base = Instant::now() + Duration::from_secs(60);
        let mut seed = 0x2545_f491_u64;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..2000 {
            let id = (next() % 64) as usize;
            match next() % 4 {
                0 | 1 => timer.add_at(
                    id,
                    base + Duration::from_millis(next() % 10_000),
                    Box::new(|| {}),
                ),
                2 => {
                    timer.remove(id);
                }
                _ => {
                    if let Some(&slot) = timer.index.get(&id) {
                        timer.heap[slot].expires = base + Duration::from_millis(next() % 10_000);
                        timer.restore(slot);
                    }
                }
            }
            check_invariants(&timer);
        }

        let mut last = None;
        while let Some((_, at)) = timer.pop() {
            if let Some(prev) = last {
                assert!(prev <= at);
            }
            last = Some(at);
            check_invariants(&timer);
        }
    }
}
