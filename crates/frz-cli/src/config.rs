//! Optional repository configuration.
//!
//! A repository may carry a `.frz/config.toml` tuning the hash family and
//! the streaming buffer geometry. Every field has a default; a missing or
//! unreadable file falls back to defaults, so correctness never depends on
//! configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use frz_repo::METADATA_DIR;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hash: HashConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Hash family used for new content IDs: `blake3` or `sha256`. Also
    /// names the index directory under `.frz/`.
    pub family: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Buffer-pool ceiling for the parallel streamer.
    pub num_buffers: usize,
    pub bytes_per_buffer: usize,
    /// Use the single-threaded streamer instead.
    pub single_threaded: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { hash: HashConfig::default(), streaming: StreamingConfig::default() }
    }
}

impl Default for HashConfig {
    fn default() -> Self {
        Self { family: frz_hash::BLAKE3_NAME.to_string() }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { num_buffers: 4, bytes_per_buffer: 1 << 20, single_threaded: false }
    }
}

impl Config {
    /// Load the config of the repository owning `working_dir`, walking
    /// upward the same way repository discovery does. Any problem reading
    /// or parsing the file is logged and answered with defaults.
    pub fn load(working_dir: &Path) -> Self {
        let Some(path) = find_config_file(working_dir) else {
            return Self::default();
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!("could not read {}: {}; using defaults", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!("could not parse {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}

fn find_config_file(start: &Path) -> Option<std::path::PathBuf> {
    let start = start.canonicalize().ok()?;
    let mut dir = start.as_path();
    loop {
        let metadata = dir.join(METADATA_DIR);
        if fs::symlink_metadata(&metadata).map(|m| m.is_dir()).unwrap_or(false) {
            let config = metadata.join(CONFIG_FILE);
            return config.is_file().then_some(config);
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.hash.family, "blake3");
        assert_eq!(config.streaming.num_buffers, 4);
        assert!(!config.streaming.single_threaded);
    }

    #[test]
    fn reads_partial_overrides_from_the_repository_root() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("deep/down");
        fs::create_dir_all(&sub).unwrap();
        fs::create_dir(dir.path().join(METADATA_DIR)).unwrap();
        fs::write(
            dir.path().join(METADATA_DIR).join(CONFIG_FILE),
            "[streaming]\nnum_buffers = 8\n",
        )
        .unwrap();

        let config = Config::load(&sub);
        assert_eq!(config.streaming.num_buffers, 8);
        // Unmentioned fields keep their defaults.
        assert_eq!(config.streaming.bytes_per_buffer, 1 << 20);
        assert_eq!(config.hash.family, "blake3");
    }

    #[test]
    fn malformed_config_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(METADATA_DIR)).unwrap();
        fs::write(dir.path().join(METADATA_DIR).join(CONFIG_FILE), "not [valid toml").unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.hash.family, "blake3");
    }
}
