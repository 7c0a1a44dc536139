use anyhow::{Context as AnyhowContext, Result};

use crate::error::RenderError;
use crate::types::{Extent, GpuPowerPreference};

/// Where presented frames end up.
pub(crate) enum PresentTarget {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        supports_copy: bool,
    },
    /// Off-screen stand-in for a swapchain, used by the capture path.
    Headless { texture: wgpu::Texture },
}

/// The image frames are drawn into between `begin_frame` and `present`.
pub(crate) enum AcquiredFrame {
    Window(wgpu::SurfaceTexture),
    Headless(wgpu::Texture),
}

impl AcquiredFrame {
    pub(crate) fn texture(&self) -> &wgpu::Texture {
        match self {
            AcquiredFrame::Window(frame) => &frame.texture,
            AcquiredFrame::Headless(texture) => texture,
        }
    }
}

pub(crate) struct GpuContext {
    pub _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub target: PresentTarget,
    pub size: Extent,
    pub surface_format: wgpu::TextureFormat,
    pub max_dimension: u32,
    pub adapter_name: String,
}

impl GpuContext {
    /// Wires instance, adapter, device and a presentable window surface.
    pub(crate) fn windowed<W>(
        window: W,
        initial_size: Extent,
        gpu_power: GpuPowerPreference,
        vsync: bool,
    ) -> Result<Self>
    where
        W: wgpu::WindowHandle + 'static,
    {
        let instance = create_instance();
        let surface = instance
            .create_surface(window)
            .context("failed to create rendering surface")?;
        let adapter = request_adapter(&instance, gpu_power, Some(&surface))?;
        let max_dimension = check_dimensions(&adapter, initial_size)?;
        let (device, queue) = request_device(&adapter)?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = pick_surface_format(&surface_caps.formats)?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .context("surface reports no alpha modes")?;

        let supports_copy = surface_caps.usages.contains(wgpu::TextureUsages::COPY_SRC);
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if supports_copy {
            usage |= wgpu::TextureUsages::COPY_SRC;
        } else {
            tracing::warn!("surface does not advertise COPY_SRC; snapshots will fail");
        }

        let present_mode = if vsync {
            wgpu::PresentMode::Fifo
        } else {
            surface_caps
                .present_modes
                .iter()
                .copied()
                .find(|mode| *mode == wgpu::PresentMode::Mailbox)
                .unwrap_or(wgpu::PresentMode::Fifo)
        };
        tracing::debug!(?present_mode, ?surface_format, "configuring surface");

        let size = clamp_size(initial_size);
        let config = wgpu::SurfaceConfiguration {
            usage,
            format: surface_format,
            width: size.width,
            height: size.height,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            adapter_name: adapter.get_info().name,
            _instance: instance,
            device,
            queue,
            target: PresentTarget::Window {
                surface,
                config,
                supports_copy,
            },
            size,
            surface_format,
            max_dimension,
        })
    }

    /// Same wiring without a window; frames land in an RGBA8 texture.
    pub(crate) fn headless(initial_size: Extent, gpu_power: GpuPowerPreference) -> Result<Self> {
        let instance = create_instance();
        let adapter = request_adapter(&instance, gpu_power, None)?;
        let max_dimension = check_dimensions(&adapter, initial_size)?;
        let (device, queue) = request_device(&adapter)?;
        let size = clamp_size(initial_size);
        let surface_format = wgpu::TextureFormat::Rgba8Unorm;
        let texture = create_headless_texture(&device, size, surface_format);

        Ok(Self {
            adapter_name: adapter.get_info().name,
            _instance: instance,
            device,
            queue,
            target: PresentTarget::Headless { texture },
            size,
            surface_format,
            max_dimension,
        })
    }

    pub(crate) fn resize(&mut self, new_size: Extent) {
        if new_size.is_empty() {
            return;
        }
        self.size = new_size;
        match &mut self.target {
            PresentTarget::Window {
                surface, config, ..
            } => {
                config.width = new_size.width;
                config.height = new_size.height;
                surface.configure(&self.device, config);
            }
            PresentTarget::Headless { texture } => {
                *texture = create_headless_texture(&self.device, new_size, self.surface_format);
            }
        }
    }

    pub(crate) fn acquire(&mut self) -> Result<AcquiredFrame, RenderError> {
        match &self.target {
            PresentTarget::Window { surface, .. } => match surface.get_current_texture() {
                Ok(frame) => Ok(AcquiredFrame::Window(frame)),
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    Err(RenderError::SurfaceOutdated)
                }
                Err(other) => Err(RenderError::Surface(other.to_string())),
            },
            PresentTarget::Headless { texture } => Ok(AcquiredFrame::Headless(texture.clone())),
        }
    }

    pub(crate) fn supports_readback(&self) -> bool {
        match &self.target {
            PresentTarget::Window { supports_copy, .. } => *supports_copy,
            PresentTarget::Headless { .. } => true,
        }
    }
}

fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

fn request_adapter(
    instance: &wgpu::Instance,
    gpu_power: GpuPowerPreference,
    surface: Option<&wgpu::Surface<'_>>,
) -> Result<wgpu::Adapter> {
    let power_preference = match gpu_power {
        GpuPowerPreference::Low => wgpu::PowerPreference::LowPower,
        GpuPowerPreference::High => wgpu::PowerPreference::HighPerformance,
    };
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference,
        compatible_surface: surface,
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")?;

    let info = adapter.get_info();
    tracing::debug!(
        name = %info.name,
        backend = ?info.backend,
        device_type = ?info.device_type,
        "selected GPU adapter"
    );
    Ok(adapter)
}

fn check_dimensions(adapter: &wgpu::Adapter, size: Extent) -> Result<u32> {
    let max_dimension = adapter.limits().max_texture_dimension_2d;
    let size = clamp_size(size);
    if size.width > max_dimension || size.height > max_dimension {
        anyhow::bail!(
            "GPU max texture dimension is {max_dimension}, requested surface is {size}"
        );
    }
    Ok(max_dimension)
}

fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("trailcam device"),
        required_features: wgpu::Features::empty(),
        required_limits: adapter.limits(),
        memory_hints: wgpu::MemoryHints::MemoryUsage,
        trace: wgpu::Trace::default(),
    }))
    .context("failed to create GPU device")
}

/// Prefers a linear format so blended values are stored unmodified.
fn pick_surface_format(formats: &[wgpu::TextureFormat]) -> Result<wgpu::TextureFormat> {
    if let Some(format) = formats.iter().copied().find(|format| !format.is_srgb()) {
        return Ok(format);
    }
    let fallback = formats
        .first()
        .copied()
        .context("surface reports no formats")?;
    tracing::warn!(
        ?fallback,
        "no linear (non-sRGB) surface format available; falling back"
    );
    Ok(fallback)
}

fn clamp_size(size: Extent) -> Extent {
    Extent::new(size.width.max(1), size.height.max(1))
}

fn create_headless_texture(
    device: &wgpu::Device,
    size: Extent,
    format: wgpu::TextureFormat,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("headless surface"),
        size: wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::TextureFormat;

    #[test]
    fn surface_format_prefers_linear() {
        let formats = [TextureFormat::Bgra8UnormSrgb, TextureFormat::Bgra8Unorm];
        assert_eq!(pick_surface_format(&formats).unwrap(), TextureFormat::Bgra8Unorm);
        assert_eq!(
            pick_surface_format(&[TextureFormat::Rgba8UnormSrgb]).unwrap(),
            TextureFormat::Rgba8UnormSrgb
        );
    }

    #[test]
    fn surface_without_formats_is_an_error() {
        assert!(pick_surface_format(&[]).is_err());
    }
}
