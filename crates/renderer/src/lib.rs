//! Renderer crate for trailcam, a live long-exposure camera.
//!
//! Camera frames are streamed into a video texture and composited by one of
//! two pipelines:
//!
//! ```text
//!   VideoSource ──▶ FrameSink ──▶ VideoTexture
//!                                     │
//!            Preview ─────────────────┼──▶ surface
//!                                     ▼
//!            Accumulate ──▶ RenderTarget (current) ◀─ blend ─ RenderTarget (previous)
//!                                     │  swap_roles
//!                                     └──▶ present pass ──▶ surface ──▶ snapshots
//! ```
//!
//! [`Compositor`] owns all render-thread state and is generic over a
//! [`RenderBackend`]: [`WgpuBackend`] drives a window or a headless GPU
//! surface, [`SoftwareBackend`] evaluates the same passes on the CPU. Other
//! threads steer it through a cloneable [`CompositorHandle`].

pub mod backend;
pub mod blend;
pub mod compile;
pub mod compositor;
pub mod error;
mod gpu;
pub mod handoff;
pub mod snapshot;
pub mod software;
pub mod texture;
pub mod types;
pub mod video;
mod window;

pub use backend::{DrawTarget, PixelLayout, RawPixels, RenderBackend, TextureId};
pub use compositor::{Compositor, FrameReport};
pub use error::{RenderError, ShaderStage, VideoError};
pub use gpu::WgpuBackend;
pub use handoff::{CompositorHandle, FrameSignal};
pub use software::SoftwareBackend;
pub use types::{Extent, GpuPowerPreference, RenderMode, RendererConfig, TextureTransform};
pub use video::{Facing, FrameFeed, FrameProvider, FrameSink, VideoFrame, VideoSource};
pub use window::run_window;
