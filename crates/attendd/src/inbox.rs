//! Engine mailbox with two lanes.
//!
//! Control requests (enroll, finalize, report, ...) are never dropped and are
//! served first. Frames from capture go into a bounded lane; when it is full
//! the oldest frame is evicted so capture never blocks on matching.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// The inbox was closed; the engine is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

pub enum Item<C, F> {
    Control(C),
    Frame(F),
}

struct Lanes<C, F> {
    control: VecDeque<C>,
    frames: VecDeque<F>,
    dropped: u64,
    closed: bool,
}

pub struct Inbox<C, F> {
    lanes: Mutex<Lanes<C, F>>,
    ready: Condvar,
    capacity: usize,
}

impl<C, F> Inbox<C, F> {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                control: VecDeque::new(),
                frames: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<C, F>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_control(&self, request: C) -> Result<(), Closed> {
        let mut lanes = self.lock();
        if lanes.closed {
            return Err(Closed);
        }
        lanes.control.push_back(request);
        drop(lanes);
        self.ready.notify_one();
        Ok(())
    }

    /// Queue a frame. Returns the evicted oldest frame when the lane was full.
    pub fn push_frame(&self, frame: F) -> Result<Option<F>, Closed> {
        let mut lanes = self.lock();
        if lanes.closed {
            return Err(Closed);
        }
        let evicted = if lanes.frames.len() >= self.capacity {
            lanes.dropped += 1;
            lanes.frames.pop_front()
        } else {
            None
        };
        lanes.frames.push_back(frame);
        drop(lanes);
        self.ready.notify_one();
        Ok(evicted)
    }

    /// Block until an item is available. Returns `None` once closed and drained.
    pub fn next(&self) -> Option<Item<C, F>> {
        let mut lanes = self.lock();
        loop {
            if let Some(c) = lanes.control.pop_front() {
                return Some(Item::Control(c));
            }
            if let Some(f) = lanes.frames.pop_front() {
                return Some(Item::Frame(f));
            }
            if lanes.closed {
                return None;
            }
            lanes = self.ready.wait(lanes).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting items; queued items are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn frames_queued(&self) -> usize {
        self.lock().frames.len()
    }

    /// Frames evicted since startup.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain(inbox: &Inbox<&'static str, u32>) -> Vec<String> {
        inbox.close();
        let mut out = Vec::new();
        while let Some(item) = inbox.next() {
            out.push(match item {
                Item::Control(c) => c.to_string(),
                Item::Frame(f) => f.to_string(),
            });
        }
        out
    }

    #[test]
    fn test_drops_oldest_frame_when_full() {
        let inbox: Inbox<&'static str, u32> = Inbox::new(3);
        for i in 0..3 {
            assert_eq!(inbox.push_frame(i), Ok(None));
        }
        assert_eq!(inbox.push_frame(3), Ok(Some(0)));
        assert_eq!(inbox.push_frame(4), Ok(Some(1)));
        assert_eq!(inbox.dropped(), 2);
        assert_eq!(inbox.frames_queued(), 3);
        assert_eq!(drain(&inbox), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_control_is_never_dropped_and_served_first() {
        let inbox: Inbox<&'static str, u32> = Inbox::new(1);
        inbox.push_frame(1).unwrap();
        inbox.push_control("enroll").unwrap();
        inbox.push_control("finalize").unwrap();
        inbox.push_frame(2).unwrap();
        assert_eq!(drain(&inbox), vec!["enroll", "finalize", "2"]);
    }

    #[test]
    fn test_closed_rejects_pushes() {
        let inbox: Inbox<&'static str, u32> = Inbox::new(2);
        inbox.close();
        assert_eq!(inbox.push_control("x"), Err(Closed));
        assert_eq!(inbox.push_frame(1), Err(Closed));
        assert!(inbox.next().is_none());
    }

    #[test]
    fn test_next_wakes_on_push() {
        let inbox: Arc<Inbox<&'static str, u32>> = Arc::new(Inbox::new(4));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            std::thread::spawn(move || match inbox.next() {
                Some(Item::Frame(f)) => f,
                _ => 0,
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        inbox.push_frame(7).unwrap();
        assert_eq!(consumer.join().unwrap(), 7);
    }
}
