//! Playback session: queues, pacing, audio, and the state machine wired
//! together behind an observer interface.
//!
//! Backend choice is declarative: each backend variant advertises its
//! capabilities in a fixed table and [`select_backend`] picks the first
//! variant satisfying the session criteria. Nothing is looked up at
//! runtime by name.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::GraphHandle;
use crate::convert::PixelFormatConverter;
use crate::error::TrackError;
use crate::frame::{AudioFrame, VideoFrame};
use crate::pacer::{RenderPacer, VideoSink, DEFAULT_REFRESH_INTERVAL};
use crate::queue::FrameQueue;
use crate::state::{
    LoadState, PlaybackConfig, PlaybackState, PlaybackStateMachine, QueueLevels, SideEffect,
    TrackLevels,
};

/// Session callbacks, delivered from whichever thread runs [`PipelinePlayer::poll`].
#[allow(unused_variables)]
pub trait PlayerObserver: Send + Sync {
    /// First transition into Playable; the session is ready for `play`.
    fn on_prepared_to_play(&self) {}
    fn on_load_state_changed(&self, state: LoadState) {}
    fn on_playback_state_changed(&self, state: PlaybackState) {}
    /// Percent of the forward buffer target currently loaded.
    fn on_buffering_progress(&self, percent: u8) {}
    /// Playback ended: cleanly (`None`) or with a fatal track error.
    fn on_finished(&self, error: Option<&TrackError>) {}
    /// Periodic position report at the configured tick cadence.
    fn on_playback_tick(&self, current: Duration, total: Option<Duration>) {}
}

// =============================================================================
// Backend selection
// =============================================================================

/// How frames are presented, as far as backend choice is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Plane,
    Sphere,
}

/// Available player backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The platform's own player; follows wireless routes, flat display only
    System,
    /// This crate's decode/convert/render pipeline
    Pipeline,
}

/// What a backend variant can do.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    pub wireless_route: bool,
    pub projected_display: bool,
}

/// Session requirements driving backend choice.
#[derive(Debug, Clone, Copy)]
pub struct BackendCriteria {
    /// Output is currently routed to a wireless device
    pub wireless_route_active: bool,
    pub display: DisplayKind,
}

/// Registered variants, in preference order.
pub const BACKEND_TABLE: &[(BackendKind, BackendCapabilities)] = &[
    (
        BackendKind::System,
        BackendCapabilities {
            wireless_route: true,
            projected_display: false,
        },
    ),
    (
        BackendKind::Pipeline,
        BackendCapabilities {
            wireless_route: false,
            projected_display: true,
        },
    ),
];

/// Picks the first registered backend satisfying the criteria.
///
/// Every criterion a session needs must be advertised by the variant;
/// when nothing matches fully the pipeline backend is the fallback.
pub fn select_backend(criteria: BackendCriteria) -> BackendKind {
    for (kind, caps) in BACKEND_TABLE {
        if criteria.wireless_route_active && !caps.wireless_route {
            continue;
        }
        if criteria.display == DisplayKind::Sphere && !caps.projected_display {
            continue;
        }
        return *kind;
    }
    BackendKind::Pipeline
}

/// The control surface both backends expose.
pub trait PlayerBackend: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: Duration);
    fn shutdown(&mut self);
}

// =============================================================================
// Pipeline session
// =============================================================================

struct NoopObserver;

impl PlayerObserver for NoopObserver {}

/// The pipeline-backed playback session.
///
/// Owns the track queues, the converter (for its pool), the render pacer,
/// and the state machine. The decode side pushes into the queues it takes
/// from [`PipelinePlayer::video_queue`]/[`PipelinePlayer::audio_queue`];
/// the embedder calls [`PipelinePlayer::poll`] on its own cadence (at
/// least as often as the tick interval).
pub struct PipelinePlayer {
    machine: PlaybackStateMachine,
    observer: Arc<dyn PlayerObserver>,
    converter: PixelFormatConverter,
    video_queue: Arc<FrameQueue<VideoFrame>>,
    audio_queue: Arc<FrameQueue<AudioFrame>>,
    pacer: RenderPacer,
    audio: Option<Arc<GraphHandle>>,
    duration: Option<Duration>,
    last_tick: Option<Instant>,
    finished: bool,
    /// The embedder rewinds the producer here on loop restart
    pending_seek: Option<Duration>,
    /// Producer-reported backlog not yet decoded into the queue
    upstream_buffer: Duration,
}

impl PipelinePlayer {
    /// Wires a session together.
    ///
    /// `sink` receives paced frames (the GPU color path in production);
    /// `audio` is the graph handle when an output device exists, `None`
    /// for video-only sessions.
    pub fn new(
        config: PlaybackConfig,
        converter: PixelFormatConverter,
        sink: Box<dyn VideoSink>,
        audio: Option<Arc<GraphHandle>>,
        observer: Option<Arc<dyn PlayerObserver>>,
        refresh_interval: Option<Duration>,
        duration: Option<Duration>,
    ) -> Self {
        let video_queue = Arc::new(FrameQueue::new(
            crate::pool::DEFAULT_POOL_CAPACITY,
        ));
        let audio_queue = Arc::new(FrameQueue::new(64));
        let pacer = RenderPacer::new(
            Arc::clone(&video_queue),
            sink,
            refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
        );
        Self {
            machine: PlaybackStateMachine::new(config),
            observer: observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            converter,
            video_queue,
            audio_queue,
            pacer,
            audio,
            duration,
            last_tick: None,
            finished: false,
            pending_seek: None,
            upstream_buffer: Duration::ZERO,
        }
    }

    /// Queue the decode side pushes video frames into.
    pub fn video_queue(&self) -> Arc<FrameQueue<VideoFrame>> {
        Arc::clone(&self.video_queue)
    }

    /// Queue the decode side pushes audio frames into.
    pub fn audio_queue(&self) -> Arc<FrameQueue<AudioFrame>> {
        Arc::clone(&self.audio_queue)
    }

    /// The converter feeding the video queue.
    pub fn converter_mut(&mut self) -> &mut PixelFormatConverter {
        &mut self.converter
    }

    /// Position the producer should rewind to, set by loop restarts.
    pub fn take_pending_seek(&mut self) -> Option<Duration> {
        self.pending_seek.take()
    }

    /// Duration of demuxed data the producer holds that has not reached
    /// the frame queue yet. Counts toward the forward buffer target; the
    /// pixel queue alone is far shallower than the target.
    pub fn set_upstream_buffer(&mut self, buffered: Duration) {
        self.upstream_buffer = buffered;
    }

    pub fn load_state(&self) -> LoadState {
        self.machine.load_state()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.machine.playback_state()
    }

    /// PTS of the most recently presented frame.
    pub fn position(&self) -> Duration {
        self.pacer.position().unwrap_or(Duration::ZERO)
    }

    pub fn play(&mut self) {
        let effects = self.machine.play();
        self.apply(effects);
    }

    pub fn pause(&mut self) {
        let effects = self.machine.pause();
        self.apply(effects);
    }

    /// Flushes the pipeline for a seek. The producer delivers frames at
    /// the new position and then calls [`PipelinePlayer::seek_completed`].
    pub fn seek(&mut self, position: Duration) {
        tracing::debug!(?position, "seek requested");
        let effects = self.machine.begin_seek();
        if effects.is_empty() {
            return;
        }
        self.apply(effects);
        self.video_queue.flush();
        self.audio_queue.flush();
        self.converter.pool().flush();
        self.upstream_buffer = Duration::ZERO;
        self.finished = false;
    }

    /// The producer has repositioned; playback resumes through buffering.
    pub fn seek_completed(&mut self) {
        let effects = self.machine.end_seek();
        self.apply(effects);
    }

    /// Reports a fatal decode failure; terminal for the session.
    pub fn fail(&mut self, error: TrackError) {
        if self.finished {
            return;
        }
        self.finished = true;
        let effects = self.machine.finish(Some(error));
        self.apply(effects);
    }

    /// Samples queue levels, advances buffering, and emits the periodic
    /// tick. Call at least once per tick interval.
    pub fn poll(&mut self) {
        // The demuxed backlog counts toward both tracks; the audio track
        // participates only when the session renders audio
        let levels = QueueLevels {
            video: TrackLevels {
                frames: self.video_queue.len(),
                loaded_duration: self.video_queue.loaded_duration() + self.upstream_buffer,
                eos: self.video_queue.is_eos(),
            },
            audio: self.audio.as_ref().map(|_| TrackLevels {
                frames: self.audio_queue.len(),
                loaded_duration: self.audio_queue.loaded_duration() + self.upstream_buffer,
                eos: self.audio_queue.is_eos(),
            }),
        };
        let effects = self.machine.update_buffering(levels);
        self.apply(effects);

        // End of stream: everything delivered and presented
        if !self.finished
            && self.video_queue.is_eos()
            && self.video_queue.is_empty()
            && self.machine.playback_state() == PlaybackState::Playing
        {
            let effects = self.machine.finish(None);
            if effects == [SideEffect::SeekToStart] {
                self.video_queue.flush();
                self.audio_queue.flush();
                self.upstream_buffer = Duration::ZERO;
                self.pending_seek = Some(Duration::ZERO);
                tracing::debug!("loop restart");
            } else {
                self.finished = true;
            }
            self.apply(effects);
        }

        let due = self
            .last_tick
            .map(|t| t.elapsed() >= self.machine.tick_interval())
            .unwrap_or(true);
        if due && self.machine.playback_state() == PlaybackState::Playing {
            self.last_tick = Some(Instant::now());
            self.observer.on_playback_tick(self.position(), self.duration);
        }
    }

    /// Stops the clocks, flushes the pool, and leaves the session in the
    /// stopped state. Safe while a render callback still holds a frame.
    pub fn shutdown(&mut self) {
        let effects = self.machine.shutdown();
        self.apply(effects);
        self.video_queue.stop();
        self.audio_queue.stop();
        self.converter.shutdown();
    }

    fn apply(&mut self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::StartPacer => self.pacer.play(),
                SideEffect::PausePacer => self.pacer.pause(),
                SideEffect::StartAudioGraph => {
                    if let Some(audio) = &self.audio {
                        audio.play();
                    }
                }
                SideEffect::PauseAudioGraph => {
                    if let Some(audio) = &self.audio {
                        audio.pause();
                    }
                }
                SideEffect::SeekToStart => {}
                SideEffect::NotifyLoadState(state) => self.observer.on_load_state_changed(state),
                SideEffect::NotifyPlaybackState(state) => {
                    self.observer.on_playback_state_changed(state)
                }
                SideEffect::NotifyPreparedToPlay => self.observer.on_prepared_to_play(),
                SideEffect::NotifyBufferingProgress(pct) => {
                    self.observer.on_buffering_progress(pct)
                }
                SideEffect::NotifyFinished(error) => self.observer.on_finished(error.as_ref()),
            }
        }
    }
}

impl PlayerBackend for PipelinePlayer {
    fn play(&mut self) {
        PipelinePlayer::play(self)
    }

    fn pause(&mut self) {
        PipelinePlayer::pause(self)
    }

    fn seek(&mut self, position: Duration) {
        PipelinePlayer::seek(self, position)
    }

    fn shutdown(&mut self) {
        PipelinePlayer::shutdown(self)
    }
}

impl Drop for PipelinePlayer {
    fn drop(&mut self) {
        if self.machine.playback_state() != PlaybackState::Stopped {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wireless_route_selects_system_backend() {
        let kind = select_backend(BackendCriteria {
            wireless_route_active: true,
            display: DisplayKind::Plane,
        });
        assert_eq!(kind, BackendKind::System);
    }

    #[test]
    fn test_projected_display_selects_pipeline_backend() {
        let kind = select_backend(BackendCriteria {
            wireless_route_active: false,
            display: DisplayKind::Sphere,
        });
        assert_eq!(kind, BackendKind::Pipeline);
    }

    #[test]
    fn test_default_criteria_prefer_first_registered() {
        let kind = select_backend(BackendCriteria {
            wireless_route_active: false,
            display: DisplayKind::Plane,
        });
        assert_eq!(kind, BackendKind::System);
    }

    #[test]
    fn test_conflicting_criteria_fall_back_to_pipeline() {
        // No variant does both; the pipeline fallback wins
        let kind = select_backend(BackendCriteria {
            wireless_route_active: true,
            display: DisplayKind::Sphere,
        });
        assert_eq!(kind, BackendKind::Pipeline);
    }
}
