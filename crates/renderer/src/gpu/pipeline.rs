use std::borrow::Cow;

use wgpu::naga::ShaderStage as NagaStage;

use crate::backend::{ProgramKind, ProgramOutput, ProgramSource};
use crate::error::{RenderError, ShaderStage};

/// Format of every off-screen accumulation target.
pub(crate) const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Per-pass uniform block, `PassParams` in the GLSL prelude.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct PassUniforms {
    pub transform: [f32; 16],
}

pub(crate) struct PipelineLayouts {
    pub uniform_layout: wgpu::BindGroupLayout,
}

impl PipelineLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        Self { uniform_layout }
    }
}

pub(crate) struct GpuProgram {
    pub kind: ProgramKind,
    pub pipeline: wgpu::RenderPipeline,
    pub texture_layout: wgpu::BindGroupLayout,
    pub texture_count: usize,
}

/// Compiles both stages and links them into a render pipeline.
///
/// wgpu reports GLSL front-end and pipeline validation failures through
/// error scopes; they are mapped onto the compile/link error variants.
pub(crate) fn link_program(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    source: &ProgramSource,
    surface_format: wgpu::TextureFormat,
) -> Result<GpuProgram, RenderError> {
    let label = source.kind.label();
    let vertex = compile_stage(device, label, &source.vertex, ShaderStage::Vertex)?;
    let fragment = compile_stage(device, label, &source.fragment, ShaderStage::Fragment)?;

    let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("texture layout"),
        entries: &build_texture_layout_entries(source.texture_count),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("program pipeline layout"),
        bind_group_layouts: &[&layouts.uniform_layout, &texture_layout],
        push_constant_ranges: &[],
    });

    let format = match source.kind.output() {
        ProgramOutput::Surface => surface_format,
        ProgramOutput::Offscreen => OFFSCREEN_FORMAT,
    };

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    });
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(RenderError::ShaderLink {
            log: err.to_string(),
        });
    }

    Ok(GpuProgram {
        kind: source.kind,
        pipeline,
        texture_layout,
        texture_count: source.texture_count,
    })
}

fn compile_stage(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    stage: ShaderStage,
) -> Result<wgpu::ShaderModule, RenderError> {
    let naga_stage = match stage {
        ShaderStage::Vertex => NagaStage::Vertex,
        ShaderStage::Fragment => NagaStage::Fragment,
    };
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(source.to_string()),
            stage: naga_stage,
            defines: &[],
        },
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(RenderError::ShaderCompile {
            stage,
            log: err.to_string(),
        }),
        None => Ok(module),
    }
}

/// Binding 0 is the shared sampler; textures follow at `1..=count`.
pub(crate) fn build_texture_layout_entries(count: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(count + 1);
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    });
    for index in 0..count {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index as u32 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
    }
    entries
}

pub(crate) fn build_texture_entries<'a>(
    sampler: &'a wgpu::Sampler,
    views: &'a [wgpu::TextureView],
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = Vec::with_capacity(views.len() + 1);
    entries.push(wgpu::BindGroupEntry {
        binding: 0,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    for (index, view) in views.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: index as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries
}
