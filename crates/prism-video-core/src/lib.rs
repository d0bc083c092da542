//! prism-video-core: color-managed, clock-paced playback pipeline.
//!
//! Decoded frames move through a fixed path: format conversion into a
//! recycling buffer pool, a bounded per-track queue, and a display-cadence
//! pacer that feeds either the GPU color path or any other [`pacer::VideoSink`].
//! Audio renders through a pull-model graph driven by the hardware
//! callback. A side-effect-returning state machine gates playback on
//! buffered depth and coordinates the two clocks.
//!
//! - Core types: [`frame`], [`error`]
//! - Conversion and pooling: [`convert`], [`pool`]
//! - Scheduling: [`queue`], [`pacer`], [`state`]
//! - GPU color path: [`render`], [`color`], [`display`]
//! - Audio: [`audio`]
//! - Session wiring and backend choice: [`player`]
//!
//! This crate has no UI dependency. The embedder supplies the
//! [`render::RenderContext`] (device, queue, target format) and drives
//! [`player::PipelinePlayer::poll`].

pub mod audio;
pub mod color;
pub mod convert;
pub mod display;
pub mod error;
pub mod frame;
pub mod pacer;
pub mod player;
pub mod pool;
pub mod queue;
pub mod render;
pub mod state;
