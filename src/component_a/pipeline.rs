//! pipeline.rs
//! Bounded queues connecting the capture, filter, HMI and flash workers.
//!
//! - `Pipeline<T>`: FIFO over a crossbeam bounded channel. The handle keeps both
//!   ends, so it never disconnects while any clone is alive.
//! - `DequePipeline<T>`: double-ended variant for raw samples (the filter may
//!   take the freshest frame from the back, or drain oldest-first from the front).
//!
//! Gets block up to a timeout and report `PipelineError::Timeout` instead of
//! failing, so each loop can re-check `exit` between waits.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::error::PipelineError;

/// `None` when `timeout` runs past what an `Instant` can hold; the wait is then untimed.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Parks on `cv` until notified or `deadline` passes. True if it timed out.
pub(crate) fn wait_deadline<T>(cv: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(at) => cv.wait_until(guard, at).timed_out(),
        None => {
            cv.wait(guard);
            false
        }
    }
}

#[derive(Debug)]
pub struct Pipeline<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> Pipeline<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Blocking put; hands the item back if no slot frees up within `timeout`.
    pub fn put(&self, item: T, timeout: Duration) -> Result<(), PipelineError<T>> {
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) => PipelineError::Full(item),
            SendTimeoutError::Disconnected(_) => PipelineError::Disconnected,
        })
    }

    pub fn try_put(&self, item: T) -> Result<(), PipelineError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => PipelineError::Full(item),
            TrySendError::Disconnected(_) => PipelineError::Disconnected,
        })
    }

    pub fn get(&self, timeout: Duration) -> Result<T, PipelineError<T>> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => PipelineError::Timeout,
            RecvTimeoutError::Disconnected => PipelineError::Disconnected,
        })
    }

    pub fn try_get(&self) -> Result<T, PipelineError<T>> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => PipelineError::Empty,
            TryRecvError::Disconnected => PipelineError::Disconnected,
        })
    }

    /// Discards everything pending. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct DequeInner<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

pub struct DequePipeline<T> {
    inner: Arc<DequeInner<T>>,
}

impl<T> Clone for DequePipeline<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

#[derive(Clone, Copy)]
enum End {
    Front,
    Back,
}

impl<T> DequePipeline<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(DequeInner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn put_back(&self, item: T, timeout: Duration) -> Result<(), PipelineError<T>> {
        self.put(item, End::Back, timeout)
    }

    pub fn put_front(&self, item: T, timeout: Duration) -> Result<(), PipelineError<T>> {
        self.put(item, End::Front, timeout)
    }

    /// Appends at the back without blocking; when full, evicts and returns the oldest item.
    pub fn put_back_evicting(&self, item: T) -> Option<T> {
        let mut items = self.inner.items.lock();
        let evicted = if items.len() >= self.inner.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        self.inner.not_empty.notify_one();
        evicted
    }

    pub fn get_front(&self, timeout: Duration) -> Result<T, PipelineError<T>> {
        self.get(End::Front, timeout)
    }

    pub fn get_back(&self, timeout: Duration) -> Result<T, PipelineError<T>> {
        self.get(End::Back, timeout)
    }

    pub fn try_get_front(&self) -> Result<T, PipelineError<T>> {
        self.take(&mut self.inner.items.lock(), End::Front)
            .ok_or(PipelineError::Empty)
    }

    pub fn try_get_back(&self) -> Result<T, PipelineError<T>> {
        self.take(&mut self.inner.items.lock(), End::Back)
            .ok_or(PipelineError::Empty)
    }

    pub fn clear(&self) -> usize {
        let mut items = self.inner.items.lock();
        let dropped = items.len();
        items.clear();
        self.inner.not_full.notify_all();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn put(&self, item: T, end: End, timeout: Duration) -> Result<(), PipelineError<T>> {
        let deadline = deadline_after(timeout);
        let mut items = self.inner.items.lock();
        while items.len() >= self.inner.capacity {
            if wait_deadline(&self.inner.not_full, &mut items, deadline)
                && items.len() >= self.inner.capacity
            {
                return Err(PipelineError::Full(item));
            }
        }
        match end {
            End::Front => items.push_front(item),
            End::Back => items.push_back(item),
        }
        self.inner.not_empty.notify_one();
        Ok(())
    }

    fn get(&self, end: End, timeout: Duration) -> Result<T, PipelineError<T>> {
        let deadline = deadline_after(timeout);
        let mut items = self.inner.items.lock();
        loop {
            if let Some(item) = self.take(&mut items, end) {
                return Ok(item);
            }
            if wait_deadline(&self.inner.not_empty, &mut items, deadline) {
                return self.take(&mut items, end).ok_or(PipelineError::Timeout);
            }
        }
    }

    fn take(&self, items: &mut VecDeque<T>, end: End) -> Option<T> {
        let item = match end {
            End::Front => items.pop_front(),
            End::Back => items.pop_back(),
        };
        if item.is_some() {
            self.inner.not_full.notify_one();
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn get_times_out_instead_of_failing() {
        let p: Pipeline<u32> = Pipeline::new(4);
        let start = Instant::now();
        assert!(matches!(p.get(SHORT), Err(PipelineError::Timeout)));
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn put_on_full_pipeline_returns_item() {
        let p = Pipeline::new(1);
        p.put(1u32, SHORT).unwrap();
        match p.put(2u32, SHORT) {
            Err(PipelineError::Full(item)) => assert_eq!(item, 2),
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn clear_discards_pending_items() {
        let p = Pipeline::new(8);
        for i in 0..5u32 {
            p.try_put(i).unwrap();
        }
        assert_eq!(p.clear(), 5);
        assert!(p.is_empty());
        assert!(matches!(p.try_get(), Err(PipelineError::Empty)));
    }

    #[test]
    fn clones_share_the_queue() {
        let p = Pipeline::new(2);
        let q = p.clone();
        let h = thread::spawn(move || q.put("hello".to_string(), Duration::from_secs(1)));
        assert_eq!(p.get(Duration::from_secs(1)).unwrap(), "hello");
        h.join().unwrap().unwrap();
    }

    #[test]
    fn deque_serves_both_ends() {
        let d = DequePipeline::new(4);
        for i in 1..=3u32 {
            d.put_back(i, SHORT).unwrap();
        }
        d.put_front(0, SHORT).unwrap();
        assert_eq!(d.get_back(SHORT).unwrap(), 3);
        assert_eq!(d.get_front(SHORT).unwrap(), 0);
        assert_eq!(d.len(), 2);
        assert_eq!(d.clear(), 2);
        assert!(matches!(d.get_front(SHORT), Err(PipelineError::Timeout)));
    }

    #[test]
    fn deque_put_blocks_until_space_frees() {
        let d = DequePipeline::new(1);
        d.put_back(1u32, SHORT).unwrap();
        assert!(matches!(d.put_back(2, SHORT), Err(PipelineError::Full(2))));

        let consumer = d.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            consumer.try_get_front()
        });
        d.put_back(3, Duration::from_secs(2)).unwrap();
        assert_eq!(h.join().unwrap().unwrap(), 1);
        assert_eq!(d.try_get_back().unwrap(), 3);
    }

    #[test]
    fn evicting_put_keeps_the_freshest() {
        let d = DequePipeline::new(2);
        assert_eq!(d.put_back_evicting(1u32), None);
        assert_eq!(d.put_back_evicting(2), None);
        assert_eq!(d.put_back_evicting(3), Some(1));
        assert_eq!(d.try_get_front().unwrap(), 2);
        assert_eq!(d.try_get_front().unwrap(), 3);
    }

    #[test]
    fn deque_accepts_unbounded_timeouts() {
        let d: DequePipeline<u32> = DequePipeline::new(1);
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(SHORT);
                d.put_back(7, Duration::MAX).unwrap();
            });
            assert_eq!(d.get_front(Duration::MAX).unwrap(), 7);
        });
        assert!(deadline_after(Duration::MAX).is_none());
    }
}
