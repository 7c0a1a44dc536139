use std::process::Command;

use tempfile::TempDir;

#[test]
fn defaults_where_reports_overrides() {
    let root = TempDir::new().unwrap();
    let config_dir = root.path().join("config");
    let data_dir = root.path().join("data");
    let pictures_dir = root.path().join("pictures");

    let output = Command::new(env!("CARGO_BIN_EXE_trailcam"))
        .env("TRAILCAM_CONFIG_DIR", &config_dir)
        .env("TRAILCAM_DATA_DIR", &data_dir)
        .env("TRAILCAM_PICTURES_DIR", &pictures_dir)
        .args(["defaults", "where"])
        .output()
        .expect("failed to run trailcam defaults where");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains(&format!("config:     {}", config_dir.display())));
    assert!(stdout.contains(&format!("pictures:   {}", pictures_dir.display())));
    assert!(stdout.contains("trailcam.toml"));
}
