//! Display-cadence frame pacing.
//!
//! The pacer owns a tick thread that wakes once per display refresh while
//! playing and pulls at most one frame from the video queue per tick. An
//! empty queue is a no-op tick, never an error; frames are delivered in
//! queue order, so presentation order follows PTS order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::frame::VideoFrame;
use crate::queue::FrameQueue;

/// Fallback tick interval when the host display rate is unknown (60 Hz).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

/// Where paced frames go: the GPU color path in production, a recording
/// sink in tests.
pub trait VideoSink: Send {
    fn deliver(&mut self, frame: VideoFrame);
}

/// Commands sent to the pacer thread.
#[derive(Debug, Clone, Copy)]
enum PacerCommand {
    Play,
    Pause,
    Stop,
}

/// Paces frame delivery to the display refresh.
pub struct RenderPacer {
    command_tx: Sender<PacerCommand>,
    handle: Option<JoinHandle<()>>,
    /// PTS of the last delivered frame, in microseconds, u64::MAX before
    /// the first delivery
    position_micros: Arc<AtomicU64>,
}

impl RenderPacer {
    /// Spawns the tick thread in the paused state.
    pub fn new(
        queue: Arc<FrameQueue<VideoFrame>>,
        mut sink: Box<dyn VideoSink>,
        refresh_interval: Duration,
    ) -> Self {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let position_micros = Arc::new(AtomicU64::new(u64::MAX));
        let position = Arc::clone(&position_micros);

        let handle = std::thread::Builder::new()
            .name("render-pacer".to_string())
            .spawn(move || {
                let mut playing = false;
                loop {
                    if playing {
                        match command_rx.recv_timeout(refresh_interval) {
                            Ok(PacerCommand::Play) => {}
                            Ok(PacerCommand::Pause) => playing = false,
                            Ok(PacerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => {
                                // One frame per tick; nothing queued means
                                // the display keeps its previous contents
                                if let Some(frame) = queue.pop() {
                                    position
                                        .store(frame.pts.as_micros() as u64, Ordering::Release);
                                    sink.deliver(frame);
                                }
                            }
                        }
                    } else {
                        match command_rx.recv() {
                            Ok(PacerCommand::Play) => playing = true,
                            Ok(PacerCommand::Pause) => {}
                            Ok(PacerCommand::Stop) | Err(_) => break,
                        }
                    }
                }
                tracing::debug!("render pacer thread exited");
            })
            .ok();

        Self {
            command_tx,
            handle,
            position_micros,
        }
    }

    /// Starts ticking. Idempotent.
    pub fn play(&self) {
        let _ = self.command_tx.send(PacerCommand::Play);
    }

    /// Stops ticking without destroying the thread. Idempotent.
    pub fn pause(&self) {
        let _ = self.command_tx.send(PacerCommand::Pause);
    }

    /// PTS of the most recently delivered frame.
    pub fn position(&self) -> Option<Duration> {
        match self.position_micros.load(Ordering::Acquire) {
            u64::MAX => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(PacerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RenderPacer {
    fn drop(&mut self) {
        self.stop();
    }
}
