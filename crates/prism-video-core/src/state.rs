//! Playback and buffering state machine.
//!
//! Transitions are pure with respect to the pipeline: each method mutates
//! only the machine and returns the list of [`SideEffect`]s the session
//! must execute. That keeps every gating rule testable without a GPU,
//! an audio device, or threads.

use std::time::{Duration, Instant};

use crate::error::TrackError;

/// How much of the stream is ready to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing buffered yet
    Idle,
    /// Buffering toward the forward target
    Loading,
    /// Enough buffered to sustain playback
    Playable,
}

/// What playback is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Seeking,
    Finished,
    Stopped,
}

/// Work the session performs on the machine's behalf.
#[derive(Debug, PartialEq)]
pub enum SideEffect {
    StartPacer,
    PausePacer,
    StartAudioGraph,
    PauseAudioGraph,
    /// Loop mode reached end of stream; rewind and keep playing
    SeekToStart,
    NotifyLoadState(LoadState),
    NotifyPlaybackState(PlaybackState),
    NotifyPreparedToPlay,
    NotifyBufferingProgress(u8),
    NotifyFinished(Option<TrackError>),
}

/// Buffering and cadence policy.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Loaded duration required ahead of the position before playback may
    /// start or resume
    pub forward_buffer_duration: Duration,
    /// Restart playback from the beginning at end of stream
    pub loop_playback: bool,
    /// Cadence of position/progress callbacks
    pub tick_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            forward_buffer_duration: Duration::from_secs(2),
            loop_playback: false,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Occupancy of one track's queue.
#[derive(Debug, Clone, Copy)]
pub struct TrackLevels {
    /// Frames sitting in the queue
    pub frames: usize,
    /// Time span of queued frames ahead of the position
    pub loaded_duration: Duration,
    /// The producer has delivered the last frame
    pub eos: bool,
}

/// Queue occupancy sampled by the session each poll.
///
/// Buffering gates on the weaker track: playback needs every active track
/// ahead of the position, and either one starving stalls it. A track at
/// end of stream stops gating (it has delivered everything it ever will).
#[derive(Debug, Clone, Copy)]
pub struct QueueLevels {
    pub video: TrackLevels,
    /// Present only when the session renders audio
    pub audio: Option<TrackLevels>,
}

impl QueueLevels {
    fn loaded_duration(&self) -> Duration {
        match &self.audio {
            Some(audio) if !audio.eos => self.video.loaded_duration.min(audio.loaded_duration),
            _ => self.video.loaded_duration,
        }
    }

    fn eos(&self) -> bool {
        self.video.eos && self.audio.map_or(true, |a| a.eos)
    }

    fn starved(&self) -> bool {
        let video = self.video.frames == 0 && !self.video.eos;
        let audio = self
            .audio
            .is_some_and(|a| a.frames == 0 && !a.eos);
        video || audio
    }
}

/// Drives load and playback state from queue levels and control calls.
pub struct PlaybackStateMachine {
    config: PlaybackConfig,
    load: LoadState,
    playback: PlaybackState,
    /// The user wants playback; start effects are deferred until Playable
    play_requested: bool,
    prepared_notified: bool,
    resume_after_seek: Option<PlaybackState>,
    rebuffer_count: u32,
    rebuffer_started: Option<Instant>,
    last_rebuffer_recovery: Option<Duration>,
}

impl PlaybackStateMachine {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            load: LoadState::Idle,
            playback: PlaybackState::Idle,
            play_requested: false,
            prepared_notified: false,
            resume_after_seek: None,
            rebuffer_count: 0,
            rebuffer_started: None,
            last_rebuffer_recovery: None,
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.load
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback
    }

    /// Times playback stalled after first becoming playable.
    pub fn rebuffer_count(&self) -> u32 {
        self.rebuffer_count
    }

    /// Wall time the most recent stall took to recover.
    pub fn last_rebuffer_recovery(&self) -> Option<Duration> {
        self.last_rebuffer_recovery
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval
    }

    /// Feeds current queue occupancy into the load state.
    ///
    /// Idle never promotes straight to Playable; the first frames move
    /// through Loading so observers always see the buffering phase.
    pub fn update_buffering(&mut self, levels: QueueLevels) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        match self.load {
            LoadState::Idle => {
                if levels.video.frames > 0 {
                    self.enter_loading(&mut effects);
                }
            }
            LoadState::Loading => {
                let target = self.config.forward_buffer_duration;
                let filled = levels.loaded_duration() >= target;
                // A finished stream is playable with whatever remains
                if filled || (levels.eos() && levels.video.frames > 0) {
                    self.load = LoadState::Playable;
                    if let Some(started) = self.rebuffer_started.take() {
                        self.last_rebuffer_recovery = Some(started.elapsed());
                    }
                    effects.push(SideEffect::NotifyLoadState(LoadState::Playable));
                    effects.push(SideEffect::NotifyBufferingProgress(100));
                    if !self.prepared_notified {
                        self.prepared_notified = true;
                        effects.push(SideEffect::NotifyPreparedToPlay);
                    }
                    // A refill resumes without an explicit play(), but a
                    // pending seek keeps its state; end_seek restores it
                    // and restarts the clocks
                    if self.play_requested && self.playback != PlaybackState::Seeking {
                        if self.playback != PlaybackState::Playing {
                            self.playback = PlaybackState::Playing;
                            effects.push(SideEffect::NotifyPlaybackState(PlaybackState::Playing));
                        }
                        effects.push(SideEffect::StartPacer);
                        effects.push(SideEffect::StartAudioGraph);
                    }
                } else {
                    let pct = (levels.loaded_duration().as_millis() * 100
                        / target.as_millis().max(1))
                    .min(99) as u8;
                    effects.push(SideEffect::NotifyBufferingProgress(pct));
                }
            }
            LoadState::Playable => {
                if levels.starved() {
                    self.rebuffer_count += 1;
                    self.rebuffer_started = Some(Instant::now());
                    self.enter_loading(&mut effects);
                    if self.playback == PlaybackState::Playing {
                        // Stall: halt the clocks but keep the playing intent
                        effects.push(SideEffect::PausePacer);
                        effects.push(SideEffect::PauseAudioGraph);
                    }
                    tracing::debug!(count = self.rebuffer_count, "playback stalled, rebuffering");
                }
            }
        }
        effects
    }

    /// Requests playback. Starts immediately when playable, otherwise the
    /// request latches and buffering starts it.
    pub fn play(&mut self) -> Vec<SideEffect> {
        self.play_requested = true;
        if self.load == LoadState::Playable && self.playback != PlaybackState::Playing {
            self.playback = PlaybackState::Playing;
            vec![
                SideEffect::NotifyPlaybackState(PlaybackState::Playing),
                SideEffect::StartPacer,
                SideEffect::StartAudioGraph,
            ]
        } else {
            Vec::new()
        }
    }

    /// Pauses playback. Idempotent; a second call produces no effects.
    pub fn pause(&mut self) -> Vec<SideEffect> {
        self.play_requested = false;
        if self.playback == PlaybackState::Playing {
            self.playback = PlaybackState::Paused;
            vec![
                SideEffect::PausePacer,
                SideEffect::PauseAudioGraph,
                SideEffect::NotifyPlaybackState(PlaybackState::Paused),
            ]
        } else {
            Vec::new()
        }
    }

    /// Enters the seeking state, remembering whether to resume.
    pub fn begin_seek(&mut self) -> Vec<SideEffect> {
        if !matches!(
            self.playback,
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Finished
        ) {
            return Vec::new();
        }
        // Seeking a finished stream resumes paused at the target
        let prior = if self.playback == PlaybackState::Finished {
            PlaybackState::Paused
        } else {
            self.playback
        };
        self.resume_after_seek = Some(prior);
        self.playback = PlaybackState::Seeking;
        let mut effects = vec![
            SideEffect::PausePacer,
            SideEffect::PauseAudioGraph,
            SideEffect::NotifyPlaybackState(PlaybackState::Seeking),
        ];
        // Queues were flushed; buffer up again before resuming
        if self.load == LoadState::Playable {
            self.load = LoadState::Loading;
            effects.push(SideEffect::NotifyLoadState(LoadState::Loading));
            effects.push(SideEffect::NotifyBufferingProgress(0));
        }
        effects
    }

    /// Leaves the seeking state, restoring the prior playback state.
    ///
    /// When the refill already made the stream playable the clocks restart
    /// here; otherwise playback resumes through buffering.
    pub fn end_seek(&mut self) -> Vec<SideEffect> {
        if self.playback != PlaybackState::Seeking {
            return Vec::new();
        }
        let prior = self.resume_after_seek.take().unwrap_or(PlaybackState::Paused);
        self.playback = prior;
        self.play_requested = prior == PlaybackState::Playing;
        let mut effects = vec![SideEffect::NotifyPlaybackState(prior)];
        if prior == PlaybackState::Playing && self.load == LoadState::Playable {
            effects.push(SideEffect::StartPacer);
            effects.push(SideEffect::StartAudioGraph);
        }
        effects
    }

    /// End of stream or a fatal track error.
    ///
    /// Errors are terminal; the machine never retries. Clean end of stream
    /// either finishes or, in loop mode, rewinds and keeps playing.
    pub fn finish(&mut self, error: Option<TrackError>) -> Vec<SideEffect> {
        if error.is_none() && self.config.loop_playback {
            return vec![SideEffect::SeekToStart];
        }
        self.play_requested = false;
        self.playback = PlaybackState::Finished;
        vec![
            SideEffect::PausePacer,
            SideEffect::PauseAudioGraph,
            SideEffect::NotifyPlaybackState(PlaybackState::Finished),
            SideEffect::NotifyFinished(error),
        ]
    }

    /// Tears the session down from any state.
    pub fn shutdown(&mut self) -> Vec<SideEffect> {
        self.play_requested = false;
        self.playback = PlaybackState::Stopped;
        self.load = LoadState::Idle;
        vec![
            SideEffect::PausePacer,
            SideEffect::PauseAudioGraph,
            SideEffect::NotifyPlaybackState(PlaybackState::Stopped),
            SideEffect::NotifyLoadState(LoadState::Idle),
        ]
    }

    fn enter_loading(&mut self, effects: &mut Vec<SideEffect>) {
        self.load = LoadState::Loading;
        effects.push(SideEffect::NotifyLoadState(LoadState::Loading));
        effects.push(SideEffect::NotifyBufferingProgress(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(frames: usize, loaded_ms: u64, eos: bool) -> TrackLevels {
        TrackLevels {
            frames,
            loaded_duration: Duration::from_millis(loaded_ms),
            eos,
        }
    }

    fn levels(frames: usize, loaded_ms: u64, eos: bool) -> QueueLevels {
        QueueLevels {
            video: track(frames, loaded_ms, eos),
            audio: None,
        }
    }

    fn machine() -> PlaybackStateMachine {
        PlaybackStateMachine::new(PlaybackConfig::default())
    }

    #[test]
    fn test_idle_never_jumps_to_playable() {
        let mut m = machine();
        let effects = m.update_buffering(levels(90, 3000, false));
        assert_eq!(m.load_state(), LoadState::Loading);
        assert!(effects.contains(&SideEffect::NotifyLoadState(LoadState::Loading)));
        // The promotion happens on the next poll
        m.update_buffering(levels(90, 3000, false));
        assert_eq!(m.load_state(), LoadState::Playable);
    }

    #[test]
    fn test_playable_requires_forward_target() {
        let mut m = machine();
        m.update_buffering(levels(10, 300, false));
        let effects = m.update_buffering(levels(10, 300, false));
        assert_eq!(m.load_state(), LoadState::Loading);
        assert!(effects.contains(&SideEffect::NotifyBufferingProgress(15)));

        let effects = m.update_buffering(levels(70, 2100, false));
        assert_eq!(m.load_state(), LoadState::Playable);
        assert!(effects.contains(&SideEffect::NotifyPreparedToPlay));
        assert!(effects.contains(&SideEffect::NotifyBufferingProgress(100)));
    }

    #[test]
    fn test_short_stream_playable_at_eos() {
        let mut m = machine();
        m.update_buffering(levels(5, 160, true));
        let _ = m.update_buffering(levels(5, 160, true));
        assert_eq!(m.load_state(), LoadState::Playable);
    }

    #[test]
    fn test_play_latches_until_playable() {
        let mut m = machine();
        assert!(m.play().is_empty());
        m.update_buffering(levels(10, 300, false));
        let effects = m.update_buffering(levels(70, 2100, false));
        assert!(effects.contains(&SideEffect::StartPacer));
        assert!(effects.contains(&SideEffect::StartAudioGraph));
        assert!(effects.contains(&SideEffect::NotifyPlaybackState(PlaybackState::Playing)));
        assert_eq!(m.playback_state(), PlaybackState::Playing);
    }

    #[test]
    fn test_play_when_playable_starts_immediately() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        let effects = m.play();
        assert!(effects.contains(&SideEffect::StartPacer));
        // Second play is a no-op
        assert!(m.play().is_empty());
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        m.play();
        let effects = m.pause();
        assert!(effects.contains(&SideEffect::PausePacer));
        assert!(m.pause().is_empty());
        assert_eq!(m.playback_state(), PlaybackState::Paused);
    }

    #[test]
    fn test_underrun_stalls_and_auto_resumes() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        m.play();

        // Queue drains: back to Loading, clocks halted, intent kept
        let effects = m.update_buffering(levels(0, 0, false));
        assert_eq!(m.load_state(), LoadState::Loading);
        assert!(effects.contains(&SideEffect::PausePacer));
        assert!(effects.contains(&SideEffect::PauseAudioGraph));
        assert_eq!(m.playback_state(), PlaybackState::Playing);
        assert_eq!(m.rebuffer_count(), 1);

        // Refill resumes without another play(), and without re-preparing
        let effects = m.update_buffering(levels(70, 2100, false));
        assert!(effects.contains(&SideEffect::StartPacer));
        assert!(!effects.contains(&SideEffect::NotifyPreparedToPlay));
        assert!(m.last_rebuffer_recovery().is_some());
    }

    #[test]
    fn test_underrun_at_eos_does_not_rebuffer() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        let effects = m.update_buffering(levels(0, 0, true));
        assert!(effects.is_empty());
        assert_eq!(m.load_state(), LoadState::Playable);
    }

    #[test]
    fn test_seek_remembers_prior_state() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        m.play();

        let effects = m.begin_seek();
        assert_eq!(m.playback_state(), PlaybackState::Seeking);
        assert!(effects.contains(&SideEffect::PausePacer));
        assert!(effects.contains(&SideEffect::NotifyLoadState(LoadState::Loading)));

        m.end_seek();
        assert_eq!(m.playback_state(), PlaybackState::Playing);
        // Resumes through buffering
        let effects = m.update_buffering(levels(70, 2100, false));
        assert!(effects.contains(&SideEffect::StartPacer));
    }

    #[test]
    fn test_refill_during_seek_keeps_seeking() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        m.play();
        m.begin_seek();

        // The producer refills before confirming the seek; the load state
        // may advance but playback must not
        let effects = m.update_buffering(levels(70, 2100, false));
        assert_eq!(m.playback_state(), PlaybackState::Seeking);
        assert_eq!(m.load_state(), LoadState::Playable);
        assert!(!effects.contains(&SideEffect::StartPacer));
        assert!(!effects.contains(&SideEffect::NotifyPlaybackState(PlaybackState::Playing)));

        // Completing the seek restores Playing and restarts the clocks
        let effects = m.end_seek();
        assert_eq!(m.playback_state(), PlaybackState::Playing);
        assert!(effects.contains(&SideEffect::StartPacer));
        assert!(effects.contains(&SideEffect::StartAudioGraph));
    }

    #[test]
    fn test_audio_track_gates_playable() {
        let mut m = machine();
        let mut l = levels(70, 2100, false);
        l.audio = Some(track(2, 300, false));
        m.update_buffering(l);
        m.update_buffering(l);
        // Video is past the target but audio is not
        assert_eq!(m.load_state(), LoadState::Loading);

        l.audio = Some(track(50, 2100, false));
        m.update_buffering(l);
        assert_eq!(m.load_state(), LoadState::Playable);
    }

    #[test]
    fn test_audio_starvation_stalls_playback() {
        let mut m = machine();
        let mut l = levels(70, 2100, false);
        l.audio = Some(track(50, 2100, false));
        m.update_buffering(l);
        m.update_buffering(l);
        m.play();

        // The audio queue drains while video frames remain
        l.audio = Some(track(0, 0, false));
        let effects = m.update_buffering(l);
        assert_eq!(m.load_state(), LoadState::Loading);
        assert!(effects.contains(&SideEffect::PausePacer));
        assert_eq!(m.playback_state(), PlaybackState::Playing);
        assert_eq!(m.rebuffer_count(), 1);
    }

    #[test]
    fn test_finished_audio_track_stops_gating() {
        let mut m = machine();
        let mut l = levels(70, 2100, false);
        // A short audio track already at end of stream does not hold back
        // the video track
        l.audio = Some(track(0, 0, true));
        m.update_buffering(l);
        let effects = m.update_buffering(l);
        assert_eq!(m.load_state(), LoadState::Playable);
        // And an empty finished track is not an underrun
        assert!(!effects.contains(&SideEffect::PausePacer));
        let effects = m.update_buffering(l);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_seek_from_paused_stays_paused() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.update_buffering(levels(70, 2100, false));
        m.play();
        m.pause();
        m.begin_seek();
        m.end_seek();
        assert_eq!(m.playback_state(), PlaybackState::Paused);
        let effects = m.update_buffering(levels(70, 2100, false));
        assert!(!effects.contains(&SideEffect::StartPacer));
    }

    #[test]
    fn test_finish_clean_and_with_error() {
        let mut m = machine();
        let effects = m.finish(None);
        assert!(effects.contains(&SideEffect::NotifyFinished(None)));
        assert_eq!(m.playback_state(), PlaybackState::Finished);

        let mut m = machine();
        let err = TrackError::DecodeFailed("bitstream".to_string());
        let effects = m.finish(Some(err.clone()));
        assert!(effects.contains(&SideEffect::NotifyFinished(Some(err))));
    }

    #[test]
    fn test_loop_mode_rewinds_instead_of_finishing() {
        let mut m = PlaybackStateMachine::new(PlaybackConfig {
            loop_playback: true,
            ..Default::default()
        });
        let effects = m.finish(None);
        assert_eq!(effects, vec![SideEffect::SeekToStart]);
        // Errors still finish, loop or not
        let effects = m.finish(Some(TrackError::DecodeFailed("x".to_string())));
        assert!(effects.contains(&SideEffect::NotifyPlaybackState(PlaybackState::Finished)));
    }

    #[test]
    fn test_shutdown_from_any_state() {
        let mut m = machine();
        m.update_buffering(levels(70, 2100, false));
        m.play();
        let effects = m.shutdown();
        assert_eq!(m.playback_state(), PlaybackState::Stopped);
        assert_eq!(m.load_state(), LoadState::Idle);
        assert!(effects.contains(&SideEffect::NotifyLoadState(LoadState::Idle)));
    }
}
