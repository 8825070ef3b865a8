use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Load a config file (format picked from its extension), with
/// `RCLITE__SECTION__KEY` environment variables layered on top.
pub fn load_cfg<T: for<'a> Deserialize<'a>>(path: impl AsRef<str>) -> anyhow::Result<T> {
    let cfg = Config::builder()
        .add_source(File::from(PathBuf::from(path.as_ref())))
        .add_source(Environment::with_prefix("RCLITE").separator("__"))
        .build()
        .with_context(|| format!("failed to read config from {}", path.as_ref()))?;

    let parsed: T = cfg
        .try_deserialize()
        .with_context(|| format!("failed to deserialize config from {}", path.as_ref()))?;

    Ok(parsed)
}
