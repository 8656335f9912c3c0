//! Error types shared by the facade and the backends.

use thiserror::Error;

/// Errors surfaced across the RHI boundary.
///
/// Backends map their native failure codes onto these variants; the facade
/// adds the frame-lifecycle violations. Nothing in this crate panics across
/// the public API in release builds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    #[error("Backend initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    #[error("Device creation failed: {0}")]
    DeviceCreationFailed(String),

    #[error("Swapchain creation failed: {0}")]
    SwapchainCreationFailed(String),

    #[error("Failed to acquire swapchain image: {0}")]
    AcquireImageFailed(String),

    #[error("Present failed: {0}")]
    PresentFailed(String),

    #[error("Buffer creation failed: {0}")]
    BufferCreationFailed(String),

    #[error("Texture creation failed: {0}")]
    TextureCreationFailed(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilationFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No frame is active")]
    FrameNotActive,

    #[error("A frame is already in flight")]
    FrameInFlight,

    #[error("Surface lost, needs recreation")]
    SurfaceLost,

    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Device lost")]
    DeviceLost,

    #[error("Internal backend error: {0}")]
    Internal(String),
}

pub type RhiResult<T> = Result<T, RhiError>;
