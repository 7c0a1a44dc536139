//! Resolves trailcam's config, data and pictures directories.
//!
//! Each root can be overridden with an environment variable; otherwise the
//! platform defaults from `directories-next` apply. Default config and data
//! directories are created on first use, overrides are taken as given.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::{ProjectDirs, UserDirs};

pub const ENV_CONFIG_DIR: &str = "TRAILCAM_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "TRAILCAM_DATA_DIR";
pub const ENV_PICTURES_DIR: &str = "TRAILCAM_PICTURES_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "trailcam";
const APPLICATION: &str = "trailcam";
const CONFIG_FILE: &str = "trailcam.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
    pictures_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;

        let config_dir = resolve_directory(ENV_CONFIG_DIR, project_dirs.config_dir(), "config")?;
        let data_dir = resolve_directory(ENV_DATA_DIR, project_dirs.data_dir(), "data")?;
        let pictures_dir = resolve_pictures_dir(&data_dir);

        Ok(Self {
            config_dir,
            data_dir,
            pictures_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Default destination for exported stills.
    pub fn pictures_dir(&self) -> &Path {
        &self.pictures_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }
}

fn resolve_directory(primary_env: &str, primary_default: &Path, label: &str) -> Result<PathBuf> {
    if let Some(value) = env_override(primary_env) {
        return Ok(value);
    }

    let primary = primary_default.to_path_buf();
    if !primary.exists() {
        fs::create_dir_all(&primary).with_context(|| {
            format!(
                "failed to create trailcam {label} directory at {}",
                primary.display()
            )
        })?;
    }
    Ok(primary)
}

fn resolve_pictures_dir(data_dir: &Path) -> PathBuf {
    if let Some(value) = env_override(ENV_PICTURES_DIR) {
        return value;
    }
    UserDirs::new()
        .and_then(|dirs| dirs.picture_dir().map(|dir| dir.join("trailcam")))
        .unwrap_or_else(|| data_dir.join("captures"))
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
