//! wgpu implementation of the render backend.
//!
//! - `context` owns instance/adapter/device wiring and the present target,
//!   either a window swapchain or a headless RGBA8 texture.
//! - `pipeline` compiles the GLSL stages through naga and links them into
//!   render pipelines with a uniform group and a per-program texture group.
//! - `state` implements [`crate::backend::RenderBackend`] on top of both and
//!   performs the padded surface readback used for snapshots.

mod context;
mod pipeline;
mod state;

pub use state::WgpuBackend;
