use crate::types::Extent;

/// Failures raised by the rendering core.
///
/// Program build errors are fatal for the pipeline: there is no fallback
/// shader. Readback errors are logged by the compositor and the pending
/// snapshot callbacks are dropped for that frame.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to compile {stage} shader: {log}")]
    ShaderCompile { stage: ShaderStage, log: String },
    #[error("failed to link shader program: {log}")]
    ShaderLink { log: String },
    #[error("render target '{label}' is incomplete: {message}")]
    FramebufferIncomplete { label: String, message: String },
    #[error("failed to read back surface pixels: {0}")]
    GraphicsReadback(String),
    #[error("sampler placeholder index {index} exceeds {available} bound textures")]
    PlaceholderIndexOutOfRange { index: usize, available: usize },
    #[error("sampler placeholder at byte {offset} has no texture index")]
    MalformedPlaceholder { offset: usize },
    #[error("render target is {target} but the viewport is {viewport}")]
    TargetSizeMismatch { target: Extent, viewport: Extent },
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("surface is outdated and must be reconfigured")]
    SurfaceOutdated,
    #[error("surface error: {0}")]
    Surface(String),
}

impl RenderError {
    /// True when reconfiguring the surface and retrying next frame is enough.
    pub fn is_recoverable_surface_error(&self) -> bool {
        matches!(self, RenderError::SurfaceOutdated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Failures raised at the video-source boundary.
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("frame payload is {actual} bytes, expected {expected} for {size}")]
    FrameSize {
        size: Extent,
        expected: usize,
        actual: usize,
    },
    #[error("frame surface has zero area")]
    EmptySurface,
    #[error("video consumer has gone away")]
    Disconnected,
    #[error("video source failed: {0}")]
    Source(String),
}
