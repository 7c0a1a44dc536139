use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use exposureconfig::{BackendKind, ExportFormat};

#[derive(Parser, Debug)]
#[command(
    name = "trailcam",
    author,
    version,
    about = "Live long-exposure camera",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Options shared by the window and the headless capture.
#[derive(Parser, Debug, Clone, Default)]
pub struct RunArgs {
    /// Configuration file; defaults to `<config_dir>/trailcam.toml` when present.
    #[arg(long, global = true, value_name = "FILE", env = "TRAILCAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Frame size for the window or capture (e.g. `1280x720`).
    #[arg(long, global = true, value_name = "WIDTHxHEIGHT")]
    pub size: Option<String>,

    /// Play images from this directory instead of the synthetic scene.
    #[arg(long, global = true, value_name = "DIR")]
    pub sequence: Option<PathBuf>,

    /// Source frame rate.
    #[arg(long, global = true, value_name = "FPS")]
    pub fps: Option<f32>,

    /// Start on the front-facing (mirrored) camera.
    #[arg(long, global = true)]
    pub mirror: bool,

    /// Directory stills are written to.
    #[arg(long, global = true, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Still image format.
    #[arg(long, global = true, value_enum, value_name = "FORMAT")]
    pub format: Option<FormatArg>,

    /// JPEG quality (1-100).
    #[arg(long, global = true, value_name = "QUALITY")]
    pub quality: Option<u8>,

    /// Prefer the high-performance GPU adapter.
    #[arg(long, global = true)]
    pub high_power: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one exposure headless and export the still.
    Capture(CaptureArgs),
    /// Inspect resolved directories.
    Defaults(DefaultsCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct CaptureArgs {
    /// Renderer backend used for the headless exposure.
    #[arg(long, value_enum, value_name = "BACKEND")]
    pub backend: Option<BackendArg>,

    /// Exposure length (e.g. `5s`, `1500ms`); converted to frames at the source fps.
    #[arg(long, value_name = "DURATION", conflicts_with = "frames")]
    pub exposure: Option<String>,

    /// Number of frames to blend.
    #[arg(long, value_name = "N")]
    pub frames: Option<u32>,

    /// Preview frames rendered before the exposure starts.
    #[arg(long, value_name = "N")]
    pub warmup: Option<u32>,

    /// Print a JSON summary instead of the bare path.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct DefaultsCommand {
    #[command(subcommand)]
    pub action: DefaultsAction,
}

#[derive(Subcommand, Debug)]
pub enum DefaultsAction {
    /// Print resolved config, data and pictures directories.
    Where,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Gpu,
    Software,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Gpu => BackendKind::Gpu,
            BackendArg::Software => BackendKind::Software,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Jpeg,
    Png,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Jpeg => ExportFormat::Jpeg,
            FormatArg::Png => ExportFormat::Png,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn capture_accepts_global_run_options() {
        let cli = Cli::try_parse_from([
            "trailcam",
            "capture",
            "--backend",
            "software",
            "--size",
            "64x48",
            "--frames",
            "20",
            "--format",
            "png",
        ])
        .unwrap();
        assert_eq!(cli.run.size.as_deref(), Some("64x48"));
        assert_eq!(cli.run.format, Some(FormatArg::Png));
        match cli.command {
            Some(Command::Capture(args)) => {
                assert_eq!(args.backend, Some(BackendArg::Software));
                assert_eq!(args.frames, Some(20));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn exposure_and_frames_conflict() {
        let result = Cli::try_parse_from([
            "trailcam",
            "capture",
            "--exposure",
            "2s",
            "--frames",
            "10",
        ]);
        assert!(result.is_err());
    }
}
