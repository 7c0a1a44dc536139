//! The stateful graphics seam the compositor runs against.
//!
//! A backend owns every GPU object; the core only ever holds opaque ids. Two
//! implementations ship with the crate: [`crate::WgpuBackend`] and the
//! CPU reference in [`crate::software::SoftwareBackend`].

use crate::error::RenderError;
use crate::types::{Extent, TextureTransform};

/// Opaque handle to a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Opaque handle to a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// Draw destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTarget {
    /// The presentable surface (window swapchain or headless image).
    Surface,
    /// An off-screen render target.
    Offscreen(TextureId),
}

/// The built-in programs the compositor links at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Live video to the surface through its sampling transform.
    Preview,
    /// Luminance-gated blend of live video against the history buffer.
    Accumulate,
    /// A render target to the surface, unmodified.
    Present,
}

impl ProgramKind {
    /// Whether the program renders into the surface or into an RGBA8 target.
    pub fn output(self) -> ProgramOutput {
        match self {
            ProgramKind::Preview | ProgramKind::Present => ProgramOutput::Surface,
            ProgramKind::Accumulate => ProgramOutput::Offscreen,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProgramKind::Preview => "preview",
            ProgramKind::Accumulate => "accumulate",
            ProgramKind::Present => "present",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramOutput {
    Surface,
    Offscreen,
}

/// Fully substituted shader sources handed to [`RenderBackend::compile_program`].
#[derive(Debug, Clone)]
pub struct ProgramSource {
    pub kind: ProgramKind,
    pub vertex: String,
    pub fragment: String,
    /// Number of textures bound at set 1, bindings `1..=texture_count`.
    pub texture_count: usize,
}

/// One full-screen triangle draw into the currently bound target.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub textures: &'a [TextureId],
    /// Sampling transform applied to the first (video) texture.
    pub transform: TextureTransform,
}

/// Byte order of a pixel in a readback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgba,
    Bgra,
}

/// Order of rows in a readback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    TopDown,
    /// Row 0 is the bottom of the frame (GL convention).
    BottomUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub channels: ChannelOrder,
    pub rows: RowOrder,
}

/// Tightly packed 8-bit pixels read back from the surface.
#[derive(Debug, Clone)]
pub struct RawPixels {
    pub size: Extent,
    pub layout: PixelLayout,
    pub bytes: Vec<u8>,
}

/// Graphics API the compositor drives on its render thread.
pub trait RenderBackend {
    /// Current surface size in physical pixels.
    fn surface_size(&self) -> Extent;
    /// Reconfigures the surface for a new viewport.
    fn configure_surface(&mut self, size: Extent) -> Result<(), RenderError>;

    /// Allocates an RGBA8 texture usable as sampler input and draw target,
    /// cleared to opaque black.
    fn create_texture(&mut self, label: &str, size: Extent) -> Result<TextureId, RenderError>;
    /// Reallocates storage for `id`, keeping the handle. Contents are cleared.
    fn resize_texture(&mut self, id: TextureId, size: Extent) -> Result<(), RenderError>;
    fn destroy_texture(&mut self, id: TextureId);
    /// Uploads top-row-first RGBA8 pixels, resizing storage when needed.
    fn upload_pixels(
        &mut self,
        id: TextureId,
        size: Extent,
        pixels: &[u8],
    ) -> Result<(), RenderError>;

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramId, RenderError>;

    /// Makes `target` the draw destination and returns the previous one.
    fn bind_target(&mut self, target: DrawTarget) -> DrawTarget;
    fn clear(&mut self, color: [f32; 4]) -> Result<(), RenderError>;
    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError>;

    /// Acquires the surface image for this frame.
    fn begin_frame(&mut self) -> Result<(), RenderError>;
    /// Flushes recorded work to the device.
    fn submit(&mut self) -> Result<(), RenderError>;
    /// Reads the whole surface back. Only valid between `submit` and `present`.
    fn read_surface(&mut self) -> Result<RawPixels, RenderError>;
    fn present(&mut self) -> Result<(), RenderError>;
}
