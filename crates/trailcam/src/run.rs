use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use exposureconfig::{
    parse_duration, parse_size, BackendKind, PowerSetting, SourceKind, TrailcamConfig,
};
use renderer::{
    Extent, Facing, GpuPowerPreference, RendererConfig, SoftwareBackend, WgpuBackend,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::capture::{self, ExposurePlan};
use crate::cli::{CaptureArgs, RunArgs};
use crate::export::{ExportHint, FileExporter, ImageExporter};
use crate::paths::AppPaths;
use crate::source::{FrameGenerator, ImageSequence, LightPainting, PacedSource};

pub fn initialise_tracing() {
    let default_filter = "warn,trailcam=info,renderer=info,naga=error,wgpu=error,wgpu_core=error,wgpu_hal=error,winit=error";
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Opens the interactive preview window.
pub fn run_window(args: &RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let config = load_config(args, &paths)?;
    let generator = build_generator(&config)?;
    let facing = initial_facing(&config);
    let source = PacedSource::new(generator, config.source.fps, facing);

    let window = &config.window;
    let renderer_config = RendererConfig {
        surface_size: (window.width, window.height),
        title: window
            .title
            .clone()
            .unwrap_or_else(|| RendererConfig::default().title),
        vsync: window.vsync,
        power: power_preference(config.renderer.power),
    };

    let mut exporter = build_exporter(&config, &paths);
    tracing::info!(
        directory = %exporter.directory().display(),
        "press space to start and stop an exposure"
    );
    let (captures_tx, captures_rx) = crossbeam_channel::unbounded();
    let export_worker = thread::Builder::new()
        .name("trailcam-export".into())
        .spawn(move || {
            for image in captures_rx {
                match exporter.export(&image, &ExportHint::now()) {
                    Ok(path) => println!("{}", path.display()),
                    Err(err) => tracing::error!("failed to export still: {err}"),
                }
            }
        })
        .context("failed to spawn export thread")?;

    let result = renderer::run_window(renderer_config, Box::new(source), captures_tx);
    if export_worker.join().is_err() {
        tracing::warn!("export thread panicked");
    }
    result
}

#[derive(Debug, Serialize)]
struct CaptureSummary {
    path: PathBuf,
    width: u32,
    height: u32,
    frames: u32,
    warmup_frames: u32,
    backend: &'static str,
    elapsed_ms: u128,
}

/// Runs one exposure headless, exports it and prints where it went.
pub fn run_capture(args: &RunArgs, capture_args: CaptureArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let mut config = load_config(args, &paths)?;
    apply_capture_overrides(&mut config, &capture_args)?;

    let size = Extent::new(config.window.width, config.window.height);
    let mut generator = build_generator(&config)?;
    let plan = ExposurePlan {
        warmup_frames: config.capture.warmup_frames,
        exposure_frames: config.exposure_frames(),
        facing: initial_facing(&config),
    };
    tracing::info!(
        frames = plan.exposure_frames,
        warmup = plan.warmup_frames,
        %size,
        "starting headless exposure"
    );

    let started = Instant::now();
    let (image, backend) = match config.renderer.backend {
        BackendKind::Software => (
            capture::expose(SoftwareBackend::new(size), &mut generator, plan)?,
            "software",
        ),
        BackendKind::Gpu => {
            let backend = WgpuBackend::headless(size, power_preference(config.renderer.power))
                .context("failed to initialise headless GPU backend")?;
            tracing::debug!(adapter = backend.adapter_name(), "headless adapter");
            (capture::expose(backend, &mut generator, plan)?, "gpu")
        }
    };

    let mut exporter = build_exporter(&config, &paths);
    let path = exporter
        .export(&image, &ExportHint::now())
        .context("failed to export still")?;

    if capture_args.json {
        let summary = CaptureSummary {
            path,
            width: image.width(),
            height: image.height(),
            frames: plan.exposure_frames,
            warmup_frames: plan.warmup_frames,
            backend,
            elapsed_ms: started.elapsed().as_millis(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

/// Reads the configuration file, then layers the CLI flags on top.
fn load_config(args: &RunArgs, paths: &AppPaths) -> Result<TrailcamConfig> {
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => {
            let default_path = paths.config_file();
            if default_path.is_file() {
                read_config(&default_path)?
            } else {
                TrailcamConfig::default()
            }
        }
    };
    apply_run_overrides(&mut config, args)?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<TrailcamConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = TrailcamConfig::from_toml_str(&raw)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn apply_run_overrides(config: &mut TrailcamConfig, args: &RunArgs) -> Result<()> {
    if let Some(raw) = &args.size {
        let (width, height) = parse_size(raw)?;
        config.window.width = width;
        config.window.height = height;
    }
    if let Some(dir) = &args.sequence {
        config.source.kind = SourceKind::Sequence;
        config.source.path = Some(dir.clone());
    }
    if let Some(fps) = args.fps {
        config.source.fps = fps;
    }
    if args.mirror {
        config.source.mirror = true;
    }
    if let Some(dir) = &args.output {
        config.export.directory = Some(dir.clone());
    }
    if let Some(format) = args.format {
        config.export.format = format.into();
    }
    if let Some(quality) = args.quality {
        config.export.quality = quality;
    }
    if args.high_power {
        config.renderer.power = PowerSetting::High;
    }
    config.validate().context("invalid settings")?;
    Ok(())
}

fn apply_capture_overrides(config: &mut TrailcamConfig, args: &CaptureArgs) -> Result<()> {
    if let Some(backend) = args.backend {
        config.renderer.backend = backend.into();
    }
    if let Some(raw) = &args.exposure {
        config.capture.exposure = Some(parse_duration(raw)?);
        config.capture.frames = None;
    }
    if let Some(frames) = args.frames {
        config.capture.frames = Some(frames);
    }
    if let Some(warmup) = args.warmup {
        config.capture.warmup_frames = warmup;
    }
    config.validate().context("invalid capture settings")?;
    Ok(())
}

fn build_generator(config: &TrailcamConfig) -> Result<Box<dyn FrameGenerator>> {
    let size = Extent::new(config.window.width, config.window.height);
    match config.source.kind {
        SourceKind::Synthetic => Ok(Box::new(LightPainting::new(size))),
        SourceKind::Sequence => {
            let dir = config
                .source
                .path
                .as_deref()
                .ok_or_else(|| anyhow!("sequence source needs a directory"))?;
            Ok(Box::new(ImageSequence::open(dir, size)?))
        }
    }
}

fn build_exporter(config: &TrailcamConfig, paths: &AppPaths) -> FileExporter {
    let directory = config
        .export
        .directory
        .clone()
        .unwrap_or_else(|| paths.pictures_dir().to_path_buf());
    FileExporter::new(directory, config.export.format, config.export.quality)
}

fn initial_facing(config: &TrailcamConfig) -> Facing {
    if config.source.mirror {
        Facing::Front
    } else {
        Facing::Back
    }
}

fn power_preference(power: PowerSetting) -> GpuPowerPreference {
    match power {
        PowerSetting::Low => GpuPowerPreference::Low,
        PowerSetting::High => GpuPowerPreference::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::BackendArg;
    use std::time::Duration;

    #[test]
    fn cli_flags_override_file_values() {
        let mut config = TrailcamConfig::from_toml_str(
            r#"
version = 1
[window]
width = 640
height = 480
[source]
fps = 24
"#,
        )
        .unwrap();
        let args = RunArgs {
            size: Some("320x200".into()),
            fps: Some(12.0),
            mirror: true,
            ..RunArgs::default()
        };
        apply_run_overrides(&mut config, &args).unwrap();
        assert_eq!((config.window.width, config.window.height), (320, 200));
        assert_eq!(config.source.fps, 12.0);
        assert_eq!(initial_facing(&config), Facing::Front);
    }

    #[test]
    fn capture_exposure_replaces_frame_count() {
        let mut config = TrailcamConfig::default();
        config.capture.frames = Some(4);
        let args = CaptureArgs {
            backend: Some(BackendArg::Software),
            exposure: Some("2s".into()),
            frames: None,
            warmup: Some(0),
            json: false,
        };
        apply_capture_overrides(&mut config, &args).unwrap();
        assert_eq!(config.renderer.backend, BackendKind::Software);
        assert_eq!(config.capture.exposure, Some(Duration::from_secs(2)));
        assert_eq!(config.exposure_frames(), 60);
        assert_eq!(config.capture.warmup_frames, 0);
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let mut config = TrailcamConfig::default();
        let args = RunArgs {
            quality: Some(0),
            ..RunArgs::default()
        };
        assert!(apply_run_overrides(&mut config, &args).is_err());
    }
}
