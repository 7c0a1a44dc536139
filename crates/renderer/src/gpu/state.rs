use std::collections::HashMap;

use anyhow::Result;
use wgpu::util::DeviceExt;

use crate::backend::{
    ChannelOrder, DrawCall, DrawTarget, PixelLayout, ProgramId, ProgramSource, RawPixels,
    RenderBackend, RowOrder, TextureId,
};
use crate::error::RenderError;
use crate::types::{Extent, GpuPowerPreference};

use super::context::{AcquiredFrame, GpuContext};
use super::pipeline::{
    build_texture_entries, link_program, GpuProgram, PassUniforms, PipelineLayouts,
    OFFSCREEN_FORMAT,
};

const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 255];

struct GpuTexture {
    label: String,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: Extent,
}

struct FrameInFlight {
    image: AcquiredFrame,
    view: wgpu::TextureView,
}

/// [`RenderBackend`] on top of wgpu, presenting to a window or a headless
/// texture.
pub struct WgpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    textures: HashMap<TextureId, GpuTexture>,
    programs: Vec<GpuProgram>,
    next_texture: u64,
    bound: DrawTarget,
    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<FrameInFlight>,
    submitted: bool,
}

impl WgpuBackend {
    /// Creates a backend presenting to `window`. The window must stay alive
    /// for as long as the backend.
    pub fn windowed<W>(
        window: W,
        size: Extent,
        power: GpuPowerPreference,
        vsync: bool,
    ) -> Result<Self>
    where
        W: wgpu::WindowHandle + 'static,
    {
        let context = GpuContext::windowed(window, size, power, vsync)?;
        Ok(Self::from_context(context))
    }

    /// Creates a backend rendering into an off-screen RGBA8 surface.
    pub fn headless(size: Extent, power: GpuPowerPreference) -> Result<Self> {
        let context = GpuContext::headless(size, power)?;
        Ok(Self::from_context(context))
    }

    pub fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    fn from_context(context: GpuContext) -> Self {
        let device = &context.device;
        let layouts = PipelineLayouts::new(device);
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("texture sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass uniforms"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform bind group"),
            layout: &layouts.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        Self {
            context,
            layouts,
            sampler,
            uniform_buffer,
            uniform_bind_group,
            textures: HashMap::new(),
            programs: Vec::new(),
            next_texture: 1,
            bound: DrawTarget::Surface,
            encoder: None,
            frame: None,
            submitted: false,
        }
    }

    fn allocate(&self, label: &str, size: Extent) -> Result<GpuTexture, RenderError> {
        let max = self.context.max_dimension;
        if size.is_empty() || size.width > max || size.height > max {
            return Err(RenderError::FramebufferIncomplete {
                label: label.to_string(),
                message: format!("storage {size} outside 1..={max}"),
            });
        }

        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent3d(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::FramebufferIncomplete {
                label: label.to_string(),
                message: err.to_string(),
            });
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let allocated = GpuTexture {
            label: label.to_string(),
            texture,
            view,
            size,
        };
        self.write_pixels(&allocated, &OPAQUE_BLACK.repeat(size.pixel_count()));
        Ok(allocated)
    }

    fn write_pixels(&self, target: &GpuTexture, pixels: &[u8]) {
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(target.size.width * 4),
                rows_per_image: Some(target.size.height),
            },
            extent3d(target.size),
        );
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture, RenderError> {
        self.textures.get(&id).ok_or(RenderError::UnknownHandle {
            kind: "texture",
            id: id.0,
        })
    }

    fn target_view(&self) -> Result<wgpu::TextureView, RenderError> {
        match self.bound {
            DrawTarget::Surface => self
                .frame
                .as_ref()
                .map(|frame| frame.view.clone())
                .ok_or_else(|| RenderError::Surface("no surface frame acquired".into())),
            DrawTarget::Offscreen(id) => self.texture(id).map(|texture| texture.view.clone()),
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.context.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            })
        })
    }

    fn readback_layout(&self) -> PixelLayout {
        let channels = match self.context.surface_format {
            wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => {
                ChannelOrder::Bgra
            }
            _ => ChannelOrder::Rgba,
        };
        PixelLayout {
            channels,
            rows: RowOrder::TopDown,
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn surface_size(&self) -> Extent {
        self.context.size
    }

    fn configure_surface(&mut self, size: Extent) -> Result<(), RenderError> {
        let max = self.context.max_dimension;
        if size.width > max || size.height > max {
            return Err(RenderError::Surface(format!(
                "surface {size} exceeds max texture dimension {max}"
            )));
        }
        self.context.resize(size);
        Ok(())
    }

    fn create_texture(&mut self, label: &str, size: Extent) -> Result<TextureId, RenderError> {
        let texture = self.allocate(label, size)?;
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn resize_texture(&mut self, id: TextureId, size: Extent) -> Result<(), RenderError> {
        let label = self.texture(id)?.label.clone();
        let texture = self.allocate(&label, size)?;
        self.textures.insert(id, texture);
        Ok(())
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
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
        if self.texture(id)?.size != size {
            self.resize_texture(id, size)?;
        }
        let texture = self.texture(id)?;
        self.write_pixels(texture, pixels);
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramId, RenderError> {
        let program = link_program(
            &self.context.device,
            &self.layouts,
            source,
            self.context.surface_format,
        )?;
        self.programs.push(program);
        Ok(ProgramId(self.programs.len() as u64 - 1))
    }

    fn bind_target(&mut self, target: DrawTarget) -> DrawTarget {
        std::mem::replace(&mut self.bound, target)
    }

    fn clear(&mut self, color: [f32; 4]) -> Result<(), RenderError> {
        let view = self.target_view()?;
        let encoder = self.encoder();
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: f64::from(color[0]),
                        g: f64::from(color[1]),
                        b: f64::from(color[2]),
                        a: f64::from(color[3]),
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError> {
        let program = self
            .programs
            .get(call.program.0 as usize)
            .ok_or(RenderError::UnknownHandle {
                kind: "program",
                id: call.program.0,
            })?;
        if call.textures.len() != program.texture_count {
            return Err(RenderError::ShaderLink {
                log: format!(
                    "{} program expects {} textures, draw supplied {}",
                    program.kind.label(),
                    program.texture_count,
                    call.textures.len()
                ),
            });
        }

        let views = call
            .textures
            .iter()
            .map(|id| self.texture(*id).map(|texture| texture.view.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let texture_bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("texture bind group"),
                layout: &program.texture_layout,
                entries: &build_texture_entries(&self.sampler, &views),
            });
        let pipeline = program.pipeline.clone();
        let target = self.target_view()?;

        // Each pass gets its own uniform values via a staging copy recorded
        // ahead of the pass on the same encoder.
        let staging = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("uniform staging"),
                contents: bytemuck::bytes_of(&PassUniforms {
                    transform: call.transform.0,
                }),
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        let uniform_buffer = self.uniform_buffer.clone();
        let uniform_bind_group = self.uniform_bind_group.clone();
        let encoder = self.encoder();
        encoder.copy_buffer_to_buffer(
            &staging,
            0,
            &uniform_buffer,
            0,
            std::mem::size_of::<PassUniforms>() as u64,
        );

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("program pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &uniform_bind_group, &[]);
        render_pass.set_bind_group(1, &texture_bind_group, &[]);
        render_pass.draw(0..3, 0..1);
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), RenderError> {
        // Work recorded by an aborted frame is discarded.
        self.encoder = None;
        self.frame = None;
        self.submitted = false;

        let image = self.context.acquire()?;
        let view = image
            .texture()
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.frame = Some(FrameInFlight { image, view });
        Ok(())
    }

    fn submit(&mut self) -> Result<(), RenderError> {
        if self.frame.is_none() {
            return Err(RenderError::Surface("submit without an open frame".into()));
        }
        if let Some(encoder) = self.encoder.take() {
            self.context.queue.submit(std::iter::once(encoder.finish()));
        }
        self.submitted = true;
        Ok(())
    }

    fn read_surface(&mut self) -> Result<RawPixels, RenderError> {
        if !self.submitted {
            return Err(RenderError::GraphicsReadback(
                "no submitted frame to read".into(),
            ));
        }
        if !self.context.supports_readback() {
            return Err(RenderError::GraphicsReadback(
                "surface does not support COPY_SRC".into(),
            ));
        }
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| RenderError::GraphicsReadback("no surface frame acquired".into()))?;

        let size = self.context.size;
        let layout = self.readback_layout();
        let bytes = read_texture(
            &self.context.device,
            &self.context.queue,
            frame.image.texture(),
            size,
        )?;
        Ok(RawPixels {
            size,
            layout,
            bytes,
        })
    }

    fn present(&mut self) -> Result<(), RenderError> {
        if !self.submitted {
            return Err(RenderError::Surface("present before submit".into()));
        }
        self.submitted = false;
        if let Some(frame) = self.frame.take() {
            if let AcquiredFrame::Window(surface_texture) = frame.image {
                surface_texture.present();
            }
        }
        Ok(())
    }
}

fn extent3d(size: Extent) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

/// Copies `texture` into a mappable buffer and strips the row padding.
fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    size: Extent,
) -> Result<Vec<u8>, RenderError> {
    let row_bytes = size.width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_row_bytes = row_bytes.div_ceil(align) * align;

    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("snapshot readback"),
        size: u64::from(padded_row_bytes) * u64::from(size.height),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("snapshot encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row_bytes),
                rows_per_image: Some(size.height),
            },
        },
        extent3d(size),
    );
    queue.submit(std::iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| RenderError::GraphicsReadback(format!("device poll failed: {err}")))?;
    rx.recv()
        .map_err(|_| RenderError::GraphicsReadback("readback channel closed".into()))?
        .map_err(|err| RenderError::GraphicsReadback(format!("buffer map failed: {err}")))?;

    let mapped = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((row_bytes * size.height) as usize);
    for row in mapped.chunks_exact(padded_row_bytes as usize) {
        pixels.extend_from_slice(&row[..row_bytes as usize]);
    }
    drop(mapped);
    buffer.unmap();
    Ok(pixels)
}
