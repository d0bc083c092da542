//! Pull-model audio render graph.
//!
//! A fixed three-node chain built once per session: time-pitch (playback
//! rate) feeds a mixer (volume/mute) feeds the hardware output. The
//! hardware callback asks for exactly N frames; whatever the input
//! delegate cannot supply is filled with silence, never a short buffer.
//!
//! The callback runs on the real-time audio thread. Nothing on that path
//! allocates or takes a blocking lock: control state lives in atomics on
//! [`GraphHandle`], the resampler scratch is preallocated for the maximum
//! rate, and the queue-backed delegate treats lock contention as underrun.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

use crate::error::AudioError;
use crate::frame::AudioFrame;
use crate::queue::FrameQueue;

/// Playback rate bounds; values outside clamp, never error.
pub const MIN_PLAYBACK_RATE: f32 = 1.0 / 32.0;
pub const MAX_PLAYBACK_RATE: f32 = 32.0;

/// Hardware output shape the graph renders into.
#[derive(Debug, Clone)]
pub struct AudioGraphConfig {
    pub sample_rate: u32,
    pub channels: usize,
    /// Largest frame count a single hardware callback may request
    pub max_frames: usize,
}

impl Default for AudioGraphConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            max_frames: 4096,
        }
    }
}

/// Supplies PCM to the graph, synchronously, on the real-time thread.
///
/// `fill` writes up to `frames * channels` interleaved samples into `out`
/// and returns the number of whole frames written. It must not block or
/// allocate; returning short is how underrun is reported, and the graph
/// fills the remainder with silence.
pub trait AudioInputDelegate: Send {
    fn fill(&mut self, out: &mut [f32], frames: usize, channels: usize) -> usize;
}

/// Lock-free control surface shared between the session and the real-time
/// callback.
///
/// Volume, mute, and rate are read once per render cycle, so an update
/// takes effect on the next cycle and never mid-buffer.
pub struct GraphHandle {
    running: AtomicBool,
    volume_bits: AtomicU32,
    muted: AtomicBool,
    rate_bits: AtomicU32,
    frames_rendered: AtomicU64,
    sample_rate: u32,
}

impl GraphHandle {
    fn new(sample_rate: u32) -> Self {
        Self {
            running: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            rate_bits: AtomicU32::new(1.0f32.to_bits()),
            frames_rendered: AtomicU64::new(0),
            sample_rate,
        }
    }

    /// Starts rendering. Idempotent; before the first `play` the callback
    /// emits silence.
    pub fn play(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Pauses rendering; the callback emits silence. Idempotent.
    pub fn pause(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mixer volume, clamped to 0.0..=1.0, applied next render cycle.
    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    /// Mute at the mixer, applied next render cycle.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Playback rate, clamped to [1/32, 32].
    pub fn set_rate(&self, rate: f32) {
        let rate = rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    pub fn rate(&self) -> f32 {
        f32::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /// Output frames rendered since the graph started; the audio clock.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// The audio clock as wall time at the output sample rate.
    pub fn playback_time(&self) -> Duration {
        let frames = self.frames_rendered();
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// Linear resampler implementing the time-pitch node.
struct TimePitchNode {
    scratch: Vec<f32>,
}

impl TimePitchNode {
    fn new(config: &AudioGraphConfig) -> Self {
        // Sized for the max rate so render never allocates
        let capacity =
            (config.max_frames as f64 * MAX_PLAYBACK_RATE as f64).ceil() as usize + 2;
        Self {
            scratch: vec![0.0; capacity * config.channels],
        }
    }

    fn render(
        &mut self,
        delegate: &mut dyn AudioInputDelegate,
        out: &mut [f32],
        frames: usize,
        channels: usize,
        rate: f32,
    ) {
        if (rate - 1.0).abs() < f32::EPSILON {
            let written = delegate.fill(out, frames, channels);
            out[written * channels..frames * channels].fill(0.0);
            return;
        }

        let src_frames = (frames as f64 * rate as f64).ceil() as usize + 1;
        if src_frames * channels > self.scratch.len() {
            // Callback asked for more than the configured maximum; degrade
            // to unresampled output rather than allocate here
            let written = delegate.fill(out, frames, channels);
            out[written * channels..frames * channels].fill(0.0);
            return;
        }
        let scratch = &mut self.scratch[..src_frames * channels];
        let written = delegate.fill(scratch, src_frames, channels);
        scratch[written * channels..].fill(0.0);

        for i in 0..frames {
            let pos = i as f64 * rate as f64;
            let i0 = pos as usize;
            let frac = (pos - i0 as f64) as f32;
            let i1 = (i0 + 1).min(src_frames - 1);
            for c in 0..channels {
                let a = scratch[i0 * channels + c];
                let b = scratch[i1 * channels + c];
                out[i * channels + c] = a + (b - a) * frac;
            }
        }
    }
}

/// Render-cycle timestamp hook; must not block.
pub type RenderHook = Box<dyn FnMut(Duration) + Send>;

/// The render chain the hardware callback drives.
///
/// Owns the input delegate and the node state; shared control goes through
/// the [`GraphHandle`]. Constructed separately from the output stream so
/// the chain can be driven without an audio device.
pub struct GraphCore {
    config: AudioGraphConfig,
    handle: Arc<GraphHandle>,
    delegate: Box<dyn AudioInputDelegate>,
    time_pitch: TimePitchNode,
    pre_render: Option<RenderHook>,
    post_render: Option<RenderHook>,
}

impl GraphCore {
    pub fn new(
        config: AudioGraphConfig,
        delegate: Box<dyn AudioInputDelegate>,
    ) -> Result<(Self, Arc<GraphHandle>), AudioError> {
        if config.sample_rate == 0 || config.channels == 0 || config.max_frames == 0 {
            return Err(AudioError::InvalidConfig(format!(
                "sample_rate={} channels={} max_frames={}",
                config.sample_rate, config.channels, config.max_frames
            )));
        }
        let handle = Arc::new(GraphHandle::new(config.sample_rate));
        let time_pitch = TimePitchNode::new(&config);
        Ok((
            Self {
                config,
                handle: Arc::clone(&handle),
                delegate,
                time_pitch,
                pre_render: None,
                post_render: None,
            },
            handle,
        ))
    }

    /// Called with the running timestamp before each render cycle.
    pub fn set_pre_render_hook(&mut self, hook: RenderHook) {
        self.pre_render = Some(hook);
    }

    /// Called with the running timestamp after each render cycle.
    pub fn set_post_render_hook(&mut self, hook: RenderHook) {
        self.post_render = Some(hook);
    }

    /// Renders one hardware buffer. `out` length must be a multiple of the
    /// channel count; the whole buffer is always written.
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = self.config.channels;
        let frames = out.len() / channels;
        if !self.handle.is_playing() {
            out.fill(0.0);
            return;
        }
        if let Some(hook) = &mut self.pre_render {
            hook(self.handle.playback_time());
        }

        let rate = self.handle.rate();
        self.time_pitch
            .render(self.delegate.as_mut(), out, frames, channels, rate);

        // Mixer: gain read once, constant across the buffer
        let gain = if self.handle.is_muted() {
            0.0
        } else {
            self.handle.volume()
        };
        if gain != 1.0 {
            for sample in out[..frames * channels].iter_mut() {
                *sample *= gain;
            }
        }

        self.handle
            .frames_rendered
            .fetch_add(frames as u64, Ordering::AcqRel);
        if let Some(hook) = &mut self.post_render {
            hook(self.handle.playback_time());
        }
    }
}

/// Pulls PCM from the audio frame queue without ever blocking.
///
/// Lock contention with the producer counts as underrun: `try_pop` gives
/// up immediately and the graph fills silence. Source frames with more
/// channels than the output are decimated to the first output channels;
/// mono sources duplicate into every output channel.
pub struct QueueInput {
    queue: Arc<FrameQueue<AudioFrame>>,
    current: Option<AudioFrame>,
    /// Frames already consumed from `current`
    offset: usize,
}

impl QueueInput {
    pub fn new(queue: Arc<FrameQueue<AudioFrame>>) -> Self {
        Self {
            queue,
            current: None,
            offset: 0,
        }
    }
}

impl AudioInputDelegate for QueueInput {
    fn fill(&mut self, out: &mut [f32], frames: usize, channels: usize) -> usize {
        let mut written = 0;
        while written < frames {
            if self.current.is_none() {
                self.current = self.queue.try_pop();
                self.offset = 0;
            }
            let Some(frame) = self.current.as_ref() else {
                break;
            };
            if frame.channels == 0 || frame.frame_count() <= self.offset {
                self.current = None;
                continue;
            }
            let src_channels = frame.channels;
            let take = (frame.frame_count() - self.offset).min(frames - written);
            for i in 0..take {
                let src_base = (self.offset + i) * src_channels;
                let dst_base = (written + i) * channels;
                for c in 0..channels {
                    out[dst_base + c] = frame.samples[src_base + c.min(src_channels - 1)];
                }
            }
            written += take;
            self.offset += take;
            if self.offset >= frame.frame_count() {
                self.current = None;
            }
        }
        written
    }
}

/// Commands for the stream-owning thread.
enum StreamCommand {
    Stop,
}

/// The production graph: a [`GraphCore`] driven by a cpal output stream.
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread builds it,
/// keeps it alive, and tears it down on stop. All runtime control goes
/// through the [`GraphHandle`].
pub struct AudioRenderGraph {
    handle: Arc<GraphHandle>,
    command_tx: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl AudioRenderGraph {
    /// Opens the default output device and starts the stream (silent until
    /// the handle's `play`).
    pub fn start(mut core: GraphCore) -> Result<Self, AudioError> {
        let handle = Arc::clone(&core.handle);
        let config = core.config.clone();
        let (command_tx, command_rx) = crossbeam_channel::bounded::<StreamCommand>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), AudioError>>(1);

        let thread = std::thread::Builder::new()
            .name("audio-graph".to_string())
            .spawn(move || {
                let stream = match build_output_stream(&config, move |data| core.render(data)) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamSetup(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until shutdown; the stream lives on this thread
                let _ = command_rx.recv();
                drop(stream);
                tracing::debug!("audio graph thread exited");
            })
            .map_err(|e| AudioError::StreamSetup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                handle,
                command_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamSetup(
                    "audio thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    /// Shared control surface for play/pause/volume/mute/rate.
    pub fn handle(&self) -> Arc<GraphHandle> {
        Arc::clone(&self.handle)
    }
}

impl Drop for AudioRenderGraph {
    fn drop(&mut self) {
        self.handle.pause();
        let _ = self.command_tx.send(StreamCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output_stream(
    config: &AudioGraphConfig,
    mut render: impl FnMut(&mut [f32]) + Send + 'static,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let stream_config = cpal::StreamConfig {
        channels: config.channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| render(data),
            |e| tracing::error!("audio stream error: {e}"),
            None,
        )
        .map_err(|e| AudioError::StreamSetup(e.to_string()))
}
