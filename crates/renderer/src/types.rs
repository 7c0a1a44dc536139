use std::fmt;

/// Which pipeline the compositor runs for the next frame.
///
/// * `Preview` passes the live video frame straight through to the surface.
/// * `Accumulate` blends every incoming frame into the persistent history and
///   presents the blended result, producing light trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Preview,
    Accumulate,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Preview => f.write_str("preview"),
            RenderMode::Accumulate => f.write_str("accumulate"),
        }
    }
}

/// Sampler family a texture has to be read through in GLSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Frames produced by a video/camera stream.
    ExternalVideo,
    /// Regular RGBA render-target storage.
    Standard2d,
}

impl SamplerKind {
    /// GLSL keyword substituted for `samplerPlaceholder<N>`.
    pub fn glsl_keyword(self) -> &'static str {
        match self {
            SamplerKind::ExternalVideo => "videoSampler2D",
            SamplerKind::Standard2d => "sampler2D",
        }
    }
}

/// Column-major 4x4 texture-coordinate transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureTransform(pub [f32; 16]);

impl TextureTransform {
    pub const IDENTITY: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Horizontal mirror (`u -> 1 - u`), used for front-facing cameras.
    pub const MIRROR_X: Self = Self([
        -1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        1.0, 0.0, 0.0, 1.0,
    ]);

    /// Applies the transform to `(u, v, 0, 1)` and returns the resulting `(u, v)`.
    pub fn apply(&self, u: f32, v: f32) -> (f32, f32) {
        let m = &self.0;
        let x = m[0] * u + m[4] * v + m[12];
        let y = m[1] * u + m[5] * v + m[13];
        let w = m[3] * u + m[7] * v + m[15];
        if w.abs() > f32::EPSILON && (w - 1.0).abs() > f32::EPSILON {
            (x / w, y / w)
        } else {
            (x, y)
        }
    }
}

impl Default for TextureTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Width/height pair in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// GPU adapter power preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    #[default]
    Low,
    High,
}

/// Immutable configuration passed to the window driver at start-up.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window size in physical pixels.
    pub surface_size: (u32, u32),
    /// Title shown by the preview window.
    pub title: String,
    /// Keep presentation synced to the display refresh.
    pub vsync: bool,
    pub power: GpuPowerPreference,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            surface_size: (1280, 720),
            title: "trailcam".to_string(),
            vsync: true,
            power: GpuPowerPreference::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_flips_horizontal_coordinate() {
        let (u, v) = TextureTransform::MIRROR_X.apply(0.25, 0.75);
        assert!((u - 0.75).abs() < 1e-6);
        assert!((v - 0.75).abs() < 1e-6);
    }

    #[test]
    fn identity_is_default() {
        assert_eq!(TextureTransform::default(), TextureTransform::IDENTITY);
        assert_eq!(TextureTransform::IDENTITY.apply(0.3, 0.6), (0.3, 0.6));
    }
}
