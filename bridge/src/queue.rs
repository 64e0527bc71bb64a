use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::Notify;

use crate::registry::Frame;

/// Bounded playback queue for one dispatcher. Pushing never blocks: when the
/// queue is full the oldest frame is dropped to make room.
pub struct FrameQueue {
    frames: Mutex<HeapRb<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            frames: Mutex::new(HeapRb::new(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `false` if an older frame had to be dropped.
    pub fn push(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }

        let evicted = self.frames.lock().push_overwrite(frame);
        self.notify.notify_one();

        match evicted {
            Some(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => true,
        }
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().try_pop()
    }

    /// Waits for the next frame. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            if let Some(frame) = self.pop() {
                return Some(frame);
            }

            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames.lock().clear();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().occupied_len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
