//! Bounded frame queue shared between a producer and a consumer thread.
//!
//! One queue per track. The producer (decode/convert side) blocks in
//! [`FrameQueue::push`] when the queue is full; the consumer never blocks,
//! pulling with [`FrameQueue::pop`] on its own cadence. Occupancy and the
//! loaded duration feed the buffering state machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::{AudioFrame, VideoFrame};

/// Anything the queue can carry: a timestamped, sized frame.
pub trait QueuedFrame: Send {
    fn pts(&self) -> Duration;
    fn frame_duration(&self) -> Duration;
}

impl QueuedFrame for VideoFrame {
    fn pts(&self) -> Duration {
        self.pts
    }

    fn frame_duration(&self) -> Duration {
        self.duration
    }
}

impl QueuedFrame for AudioFrame {
    fn pts(&self) -> Duration {
        self.pts
    }

    fn frame_duration(&self) -> Duration {
        self.duration
    }
}

struct QueueState<T> {
    frames: VecDeque<T>,
    /// Sum of queued frame durations, maintained incrementally
    loaded: Duration,
    /// Highest PTS accepted since the last flush, for the ordering check
    last_pts: Option<Duration>,
}

/// A thread-safe bounded queue of decoded frames.
pub struct FrameQueue<T: QueuedFrame> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    frame_available: Condvar,
    space_available: Condvar,
    /// Set while the queue is being flushed (seek)
    flushing: AtomicBool,
    /// Set once the producer has delivered the last frame
    eos: AtomicBool,
    /// Set on shutdown; wakes blocked producers so they can exit
    stopped: AtomicBool,
}

impl<T: QueuedFrame> FrameQueue<T> {
    /// Creates a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                loaded: Duration::ZERO,
                last_pts: None,
            }),
            capacity,
            frame_available: Condvar::new(),
            space_available: Condvar::new(),
            flushing: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Pushes a frame, blocking while the queue is full.
    ///
    /// Returns false if the queue is flushed or stopped while waiting; the
    /// frame should be discarded.
    pub fn push(&self, frame: T) -> bool {
        let mut state = self.state.lock();
        while state.frames.len() >= self.capacity {
            if self.flushing.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
                return false;
            }
            self.space_available.wait(&mut state);
        }
        if self.flushing.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.accept(&mut state, frame);
        self.frame_available.notify_one();
        true
    }

    /// Pushes a frame without blocking. Returns false if full, flushing,
    /// or stopped.
    pub fn try_push(&self, frame: T) -> bool {
        if self.flushing.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.state.lock();
        if state.frames.len() >= self.capacity {
            return false;
        }
        self.accept(&mut state, frame);
        self.frame_available.notify_one();
        true
    }

    fn accept(&self, state: &mut QueueState<T>, frame: T) {
        let pts = frame.pts();
        if let Some(last) = state.last_pts {
            if pts < last {
                tracing::warn!(?pts, ?last, "frame pushed out of presentation order");
            }
        }
        state.last_pts = Some(state.last_pts.map_or(pts, |l| l.max(pts)));
        state.loaded += frame.frame_duration();
        state.frames.push_back(frame);
    }

    /// Takes the next frame without blocking.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let frame = state.frames.pop_front();
        if let Some(frame) = &frame {
            state.loaded = state.loaded.saturating_sub(frame.frame_duration());
            self.space_available.notify_one();
        }
        frame
    }

    /// Takes the next frame if the lock is immediately available.
    ///
    /// For real-time callers that must not wait on the producer.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.try_lock()?;
        let frame = state.frames.pop_front();
        if let Some(frame) = &frame {
            state.loaded = state.loaded.saturating_sub(frame.frame_duration());
            self.space_available.notify_one();
        }
        frame
    }

    /// Returns the presentation timestamp of the next frame without
    /// removing it.
    pub fn peek_pts(&self) -> Option<Duration> {
        self.state.lock().frames.front().map(|f| f.pts())
    }

    /// Time span of queued frames (sum of their durations).
    pub fn loaded_duration(&self) -> Duration {
        self.state.lock().loaded
    }

    /// End of the buffered span: PTS plus duration of the last queued frame.
    pub fn loaded_end(&self) -> Option<Duration> {
        let state = self.state.lock();
        state.frames.back().map(|f| f.pts() + f.frame_duration())
    }

    /// Returns the number of frames currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears all frames for a seek.
    ///
    /// Ordering: set flushing (blocks producers), clear the queue, clear
    /// eos, then clear flushing. Producers check flushing before pushing,
    /// so by the time they can push again eos is already reset. The
    /// ordering check restarts from the next accepted frame.
    pub fn flush(&self) {
        self.flushing.store(true, Ordering::Release);
        self.space_available.notify_all();
        let dropped = {
            let mut state = self.state.lock();
            let count = state.frames.len();
            state.frames.clear();
            state.loaded = Duration::ZERO;
            state.last_pts = None;
            count
        };
        tracing::debug!(dropped, "frame queue flushed");
        self.eos.store(false, Ordering::Release);
        self.flushing.store(false, Ordering::Release);
    }

    /// Marks that the producer has delivered the last frame.
    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::Release);
        self.frame_available.notify_all();
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// Stops the queue, waking blocked producers so shutdown cannot
    /// deadlock in `push`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.space_available.notify_all();
        self.frame_available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
