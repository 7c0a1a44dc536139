use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Largest window or capture edge accepted from configuration.
pub const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrailcamConfig {
    pub version: u32,
    #[serde(default)]
    pub window: WindowSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub renderer: RendererSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowSection {
    pub width: u32,
    pub height: u32,
    pub title: Option<String>,
    pub vsync: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated light-painting scene.
    #[default]
    Synthetic,
    /// Image files from a directory, played in name order.
    Sequence,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSection {
    pub kind: SourceKind,
    pub fps: f32,
    pub path: Option<PathBuf>,
    /// Start on the front-facing (mirrored) camera.
    pub mirror: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSection {
    #[serde(
        default = "default_exposure",
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub exposure: Option<Duration>,
    /// Overrides the frame count derived from `exposure` and the source fps.
    pub frames: Option<u32>,
    pub warmup_frames: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Jpeg,
    Png,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Png => "png",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportSection {
    pub directory: Option<PathBuf>,
    pub format: ExportFormat,
    pub quality: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Gpu,
    Software,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererSection {
    pub backend: BackendKind,
    pub power: PowerSetting,
}

impl Default for TrailcamConfig {
    fn default() -> Self {
        Self {
            version: 1,
            window: WindowSection::default(),
            source: SourceSection::default(),
            capture: CaptureSection::default(),
            export: ExportSection::default(),
            renderer: RendererSection::default(),
        }
    }
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: None,
            vsync: true,
        }
    }
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            fps: 30.0,
            path: None,
            mirror: false,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            exposure: default_exposure(),
            frames: None,
            warmup_frames: 3,
        }
    }
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            directory: None,
            format: ExportFormat::default(),
            quality: 100,
        }
    }
}

fn default_exposure() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.is_finite() || v.is_sign_negative() {
                return Err(E::custom("duration must be a finite, non-negative number"));
            }
            Duration::try_from_secs_f64(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses a duration the way config files spell them: `"5s"`, `"1500ms"`,
/// or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "duration '{raw}' must be a finite, non-negative number"
            )));
        }
        return Duration::try_from_secs_f64(seconds)
            .map_err(|err| ConfigError::Invalid(format!("invalid duration '{raw}': {err}")));
    }
    humantime::parse_duration(raw)
        .map_err(|err| ConfigError::Invalid(format!("invalid duration '{raw}': {err}")))
}

/// Parses a `WIDTHxHEIGHT` pair such as `1280x720`.
pub fn parse_size(raw: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("size '{raw}' must look like WIDTHxHEIGHT"));
    let (width, height) = raw
        .trim()
        .split_once(|ch: char| ch == 'x' || ch == 'X')
        .ok_or_else(invalid)?;
    let width: u32 = width.trim().parse().map_err(|_| invalid())?;
    let height: u32 = height.trim().parse().map_err(|_| invalid())?;
    validate_size("size", width, height)?;
    Ok((width, height))
}

fn validate_size(what: &str, width: u32, height: u32) -> Result<(), ConfigError> {
    if width == 0 || height == 0 {
        return Err(ConfigError::Invalid(format!(
            "{what} must be non-zero, got {width}x{height}"
        )));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ConfigError::Invalid(format!(
            "{what} {width}x{height} exceeds {MAX_DIMENSION} pixels per edge"
        )));
    }
    Ok(())
}

impl TrailcamConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: TrailcamConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn exposure(&self) -> Duration {
        self.capture
            .exposure
            .or_else(default_exposure)
            .unwrap_or_default()
    }

    /// Frames blended for one exposure: the explicit count, or the exposure
    /// length at the source frame rate. Never less than one.
    pub fn exposure_frames(&self) -> u32 {
        let frames = self.capture.frames.unwrap_or_else(|| {
            (self.exposure().as_secs_f32() * self.source.fps).round() as u32
        });
        frames.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        validate_size("window size", self.window.width, self.window.height)?;

        if !self.source.fps.is_finite() || self.source.fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "source.fps must be > 0, got {}",
                self.source.fps
            )));
        }

        if self.source.kind == SourceKind::Sequence {
            match &self.source.path {
                Some(path) if !path.as_os_str().is_empty() => {}
                _ => {
                    return Err(ConfigError::Invalid(
                        "source.path is required when source.kind = \"sequence\"".into(),
                    ));
                }
            }
        }

        if let Some(exposure) = self.capture.exposure {
            if exposure.is_zero() {
                return Err(ConfigError::Invalid(
                    "capture.exposure must be greater than zero".into(),
                ));
            }
        }

        if self.capture.frames == Some(0) {
            return Err(ConfigError::Invalid("capture.frames must be > 0".into()));
        }

        if !(1..=100).contains(&self.export.quality) {
            return Err(ConfigError::Invalid(format!(
                "export.quality must be within 1..=100, got {}",
                self.export.quality
            )));
        }

        Ok(())
    }
}
