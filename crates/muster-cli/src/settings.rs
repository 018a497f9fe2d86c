//! Runtime configuration, read from `muster.toml` and `MUSTER_*` variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{FixedOffset, Local, Offset as _};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct MusterConfig {
  #[serde(default = "default_store_path")]
  pub store_path:                  PathBuf,
  /// Offset of the community's calendar from UTC, in minutes. Monthly quotas
  /// roll over at local midnight on the 1st. Defaults to the host's offset.
  #[serde(default)]
  pub calendar_utc_offset_minutes: Option<i32>,
}

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/muster/muster.db") }

impl MusterConfig {
  /// Layer `path` (optional) under `MUSTER_`-prefixed environment variables.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("MUSTER"))
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise MusterConfig")
  }

  pub fn calendar(&self) -> anyhow::Result<FixedOffset> {
    match self.calendar_utc_offset_minutes {
      Some(minutes) => FixedOffset::east_opt(minutes * 60)
        .with_context(|| format!("calendar offset of {minutes} minutes is out of range")),
      None => Ok(Local::now().offset().fix()),
    }
  }

  pub fn resolved_store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
