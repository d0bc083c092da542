//! Error types for the playback pipeline.

/// Errors raised while setting up or feeding a media track.
///
/// Setup failures (pool or scratch allocation, bad geometry) are fatal to
/// the track; per-frame conversion failures are reported through
/// [`crate::convert::ConvertError`] instead so the frame can be skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// Errors raised by the GPU color path.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render pipelines not ready")]
    NotReady,
    #[error("unsupported render target format {0:?}")]
    TargetFormat(wgpu::TextureFormat),
    #[error("frame has no planes")]
    EmptyFrame,
}

/// Errors raised by the audio render graph.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("audio stream setup failed: {0}")]
    StreamSetup(String),
    #[error("invalid audio graph config: {0}")]
    InvalidConfig(String),
}
