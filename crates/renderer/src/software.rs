//! CPU reference backend.
//!
//! Executes the built-in programs with nearest-neighbour sampling over
//! 8-bit storage and reads the surface back bottom-up, the way a GL
//! `glReadPixels` call would. Used by the headless capture path when no
//! adapter is wanted, and by the tests.

use std::collections::BTreeMap;

use crate::backend::{
    ChannelOrder, DrawCall, DrawTarget, PixelLayout, ProgramId, ProgramKind, ProgramSource,
    RawPixels, RenderBackend, RowOrder, TextureId,
};
use crate::blend::luminance_gated_mix;
use crate::error::{RenderError, ShaderStage};
use crate::types::{Extent, TextureTransform};

const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 255];

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub textures_created: u64,
    pub textures_destroyed: u64,
    pub programs_compiled: u64,
    pub draws: u64,
    pub readbacks: u64,
    pub frames_presented: u64,
}

struct CpuImage {
    size: Extent,
    pixels: Vec<u8>,
}

impl CpuImage {
    fn black(size: Extent) -> Self {
        Self {
            size,
            pixels: OPAQUE_BLACK.repeat(size.pixel_count()),
        }
    }

    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        if self.size.is_empty() {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let x = texel_index(u, self.size.width);
        let y = texel_index(v, self.size.height);
        let offset = (y * self.size.width as usize + x) * 4;
        std::array::from_fn(|i| f32::from(self.pixels[offset + i]) / 255.0)
    }
}

fn texel_index(coord: f32, extent: u32) -> usize {
    let scaled = (coord * extent as f32).floor();
    scaled.clamp(0.0, (extent - 1) as f32) as usize
}

fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub struct SoftwareBackend {
    surface: CpuImage,
    textures: BTreeMap<TextureId, CpuImage>,
    programs: Vec<ProgramSource>,
    next_texture: u64,
    bound: DrawTarget,
    frame_open: bool,
    submitted: bool,
    readback_layout: PixelLayout,
    compile_failure: Option<String>,
    fail_readbacks: bool,
    allocation_budget: Option<u32>,
    presented: Option<Vec<u8>>,
    stats: SoftwareStats,
}

impl SoftwareBackend {
    pub fn new(size: Extent) -> Self {
        Self {
            surface: CpuImage::black(size),
            textures: BTreeMap::new(),
            programs: Vec::new(),
            next_texture: 1,
            bound: DrawTarget::Surface,
            frame_open: false,
            submitted: false,
            readback_layout: PixelLayout {
                channels: ChannelOrder::Rgba,
                rows: RowOrder::BottomUp,
            },
            compile_failure: None,
            fail_readbacks: false,
            allocation_budget: None,
            presented: None,
            stats: SoftwareStats::default(),
        }
    }

    /// Emulates surfaces that read back in another byte or row order.
    pub fn with_readback_layout(mut self, layout: PixelLayout) -> Self {
        self.readback_layout = layout;
        self
    }

    /// Makes the next `compile_program` call fail with `log`.
    pub fn fail_next_compile(&mut self, log: impl Into<String>) {
        self.compile_failure = Some(log.into());
    }

    pub fn fail_readbacks(&mut self, fail: bool) {
        self.fail_readbacks = fail;
    }

    /// Lets `remaining` more textures be created before allocation fails, as
    /// a device out of memory would. `None` lifts the limit.
    pub fn limit_allocations(&mut self, remaining: Option<u32>) {
        self.allocation_budget = remaining;
    }

    /// The sources a program was linked from.
    pub fn program_source(&self, id: ProgramId) -> Option<&ProgramSource> {
        self.programs.get(id.0 as usize)
    }

    pub fn stats(&self) -> SoftwareStats {
        self.stats
    }

    pub fn bound_target(&self) -> DrawTarget {
        self.bound
    }

    pub fn texture_pixels(&self, id: TextureId) -> Option<&[u8]> {
        self.textures.get(&id).map(|image| image.pixels.as_slice())
    }

    pub fn texture_size(&self, id: TextureId) -> Option<Extent> {
        self.textures.get(&id).map(|image| image.size)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Top-down RGBA contents of the surface as last drawn.
    pub fn surface_pixels(&self) -> &[u8] {
        &self.surface.pixels
    }

    /// Top-down RGBA contents of the last presented frame.
    pub fn presented_pixels(&self) -> Option<&[u8]> {
        self.presented.as_deref()
    }

    fn texture(&self, id: TextureId) -> Result<&CpuImage, RenderError> {
        self.textures.get(&id).ok_or(RenderError::UnknownHandle {
            kind: "texture",
            id: id.0,
        })
    }

    fn target_mut(&mut self) -> Result<&mut CpuImage, RenderError> {
        match self.bound {
            DrawTarget::Surface => Ok(&mut self.surface),
            DrawTarget::Offscreen(id) => {
                self.textures
                    .get_mut(&id)
                    .ok_or(RenderError::UnknownHandle {
                        kind: "texture",
                        id: id.0,
                    })
            }
        }
    }

    fn target_size(&self) -> Result<Extent, RenderError> {
        match self.bound {
            DrawTarget::Surface => Ok(self.surface.size),
            DrawTarget::Offscreen(id) => self.texture(id).map(|image| image.size),
        }
    }

    fn shade(
        kind: ProgramKind,
        inputs: &[&CpuImage],
        transform: &TextureTransform,
        u: f32,
        v: f32,
    ) -> [f32; 4] {
        match kind {
            ProgramKind::Preview => {
                let (tu, tv) = transform.apply(u, v);
                inputs[0].sample(tu, tv)
            }
            ProgramKind::Accumulate => {
                let (tu, tv) = transform.apply(u, v);
                let incoming = inputs[0].sample(tu, tv);
                let history = inputs[1].sample(u, v);
                luminance_gated_mix(incoming, history)
            }
            ProgramKind::Present => inputs[0].sample(u, v),
        }
    }
}

fn expected_texture_count(kind: ProgramKind) -> usize {
    match kind {
        ProgramKind::Preview | ProgramKind::Present => 1,
        ProgramKind::Accumulate => 2,
    }
}

impl RenderBackend for SoftwareBackend {
    fn surface_size(&self) -> Extent {
        self.surface.size
    }

    fn configure_surface(&mut self, size: Extent) -> Result<(), RenderError> {
        if size != self.surface.size {
            self.surface = CpuImage::black(size);
        }
        Ok(())
    }

    fn create_texture(&mut self, label: &str, size: Extent) -> Result<TextureId, RenderError> {
        if size.is_empty() {
            return Err(RenderError::FramebufferIncomplete {
                label: label.to_string(),
                message: format!("zero-area storage {size}"),
            });
        }
        if let Some(remaining) = self.allocation_budget.as_mut() {
            if *remaining == 0 {
                return Err(RenderError::FramebufferIncomplete {
                    label: label.to_string(),
                    message: "out of texture memory".to_string(),
                });
            }
            *remaining -= 1;
        }
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(id, CpuImage::black(size));
        self.stats.textures_created += 1;
        Ok(id)
    }

    fn resize_texture(&mut self, id: TextureId, size: Extent) -> Result<(), RenderError> {
        if size.is_empty() {
            return Err(RenderError::FramebufferIncomplete {
                label: format!("texture {}", id.0),
                message: format!("zero-area storage {size}"),
            });
        }
        if let Some(remaining) = self.allocation_budget.as_mut() {
            if *remaining == 0 {
                return Err(RenderError::FramebufferIncomplete {
                    label: format!("texture {}", id.0),
                    message: "out of texture memory".to_string(),
                });
            }
            *remaining -= 1;
        }
        let image = self.textures.get_mut(&id).ok_or(RenderError::UnknownHandle {
            kind: "texture",
            id: id.0,
        })?;
        *image = CpuImage::black(size);
        Ok(())
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_some() {
            self.stats.textures_destroyed += 1;
        }
    }

    fn upload_pixels(
        &mut self,
        id: TextureId,
        size: Extent,
        pixels: &[u8],
    ) -> Result<(), RenderError> {
        if pixels.len() != size.pixel_count() * 4 {
            return Err(RenderError::FramebufferIncomplete {
                label: format!("texture {}", id.0),
                message: format!("{} bytes uploaded for {size}", pixels.len()),
            });
        }
        let image = self.textures.get_mut(&id).ok_or(RenderError::UnknownHandle {
            kind: "texture",
            id: id.0,
        })?;
        image.size = size;
        image.pixels.clear();
        image.pixels.extend_from_slice(pixels);
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramId, RenderError> {
        if let Some(log) = self.compile_failure.take() {
            return Err(RenderError::ShaderCompile {
                stage: ShaderStage::Fragment,
                log,
            });
        }
        for (stage, text) in [
            (ShaderStage::Vertex, &source.vertex),
            (ShaderStage::Fragment, &source.fragment),
        ] {
            if !text.contains("void main") {
                return Err(RenderError::ShaderCompile {
                    stage,
                    log: "missing entry point 'main'".to_string(),
                });
            }
        }
        if source.fragment.contains("samplerPlaceholder") {
            return Err(RenderError::ShaderCompile {
                stage: ShaderStage::Fragment,
                log: "unresolved sampler placeholder".to_string(),
            });
        }
        let expected = expected_texture_count(source.kind);
        if source.texture_count != expected {
            return Err(RenderError::ShaderLink {
                log: format!(
                    "{} program samples {expected} textures, {} bound",
                    source.kind.label(),
                    source.texture_count
                ),
            });
        }

        self.programs.push(source.clone());
        self.stats.programs_compiled += 1;
        Ok(ProgramId(self.programs.len() as u64 - 1))
    }

    fn bind_target(&mut self, target: DrawTarget) -> DrawTarget {
        std::mem::replace(&mut self.bound, target)
    }

    fn clear(&mut self, color: [f32; 4]) -> Result<(), RenderError> {
        let texel = color.map(quantize);
        let target = self.target_mut()?;
        for pixel in target.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&texel);
        }
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError> {
        let kind = self
            .programs
            .get(call.program.0 as usize)
            .map(|source| source.kind)
            .ok_or(RenderError::UnknownHandle {
                kind: "program",
                id: call.program.0,
            })?;
        let expected = expected_texture_count(kind);
        if call.textures.len() != expected {
            return Err(RenderError::ShaderLink {
                log: format!(
                    "{} program expects {expected} textures, draw supplied {}",
                    kind.label(),
                    call.textures.len()
                ),
            });
        }
        if let DrawTarget::Offscreen(id) = self.bound {
            if call.textures.contains(&id) {
                return Err(RenderError::FramebufferIncomplete {
                    label: format!("texture {}", id.0),
                    message: "texture is both sampled and drawn into".to_string(),
                });
            }
        }

        let size = self.target_size()?;
        let inputs = call
            .textures
            .iter()
            .map(|id| self.texture(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = Vec::with_capacity(size.pixel_count() * 4);
        for y in 0..size.height {
            let v = (y as f32 + 0.5) / size.height as f32;
            for x in 0..size.width {
                let u = (x as f32 + 0.5) / size.width as f32;
                let color = Self::shade(kind, &inputs, &call.transform, u, v);
                output.extend(color.map(quantize));
            }
        }

        self.target_mut()?.pixels = output;
        self.stats.draws += 1;
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), RenderError> {
        self.frame_open = true;
        self.submitted = false;
        Ok(())
    }

    fn submit(&mut self) -> Result<(), RenderError> {
        if !self.frame_open {
            return Err(RenderError::Surface("submit without an open frame".into()));
        }
        self.submitted = true;
        Ok(())
    }

    fn read_surface(&mut self) -> Result<RawPixels, RenderError> {
        if self.fail_readbacks {
            return Err(RenderError::GraphicsReadback(
                "readback disabled on this surface".into(),
            ));
        }
        if !self.submitted {
            return Err(RenderError::GraphicsReadback(
                "no submitted frame to read".into(),
            ));
        }

        let size = self.surface.size;
        if size.is_empty() {
            return Err(RenderError::GraphicsReadback("surface has zero area".into()));
        }
        let row_bytes = size.width as usize * 4;
        let mut bytes = Vec::with_capacity(self.surface.pixels.len());
        let rows: Box<dyn Iterator<Item = &[u8]>> = match self.readback_layout.rows {
            RowOrder::TopDown => Box::new(self.surface.pixels.chunks_exact(row_bytes)),
            RowOrder::BottomUp => Box::new(self.surface.pixels.chunks_exact(row_bytes).rev()),
        };
        for row in rows {
            bytes.extend_from_slice(row);
        }
        if self.readback_layout.channels == ChannelOrder::Bgra {
            for pixel in bytes.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }

        self.stats.readbacks += 1;
        Ok(RawPixels {
            size,
            layout: self.readback_layout,
            bytes,
        })
    }

    fn present(&mut self) -> Result<(), RenderError> {
        if !self.submitted {
            return Err(RenderError::Surface("present before submit".into()));
        }
        self.presented = Some(self.surface.pixels.clone());
        self.frame_open = false;
        self.submitted = false;
        self.stats.frames_presented += 1;
        Ok(())
    }
}
