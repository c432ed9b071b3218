use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Constants that determine raw similarity scores. Changing any of these
/// invalidates every cached comparison, so they are fingerprinted into the
/// cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaterConfig {
    /// Weight of the message rating in the combined score; the diff rating
    /// gets the complement.
    pub message_diff_weight: f64,
    /// Minimum similarity for two file paths to be considered the same
    /// file. At 1.0 or above, only exact path matches count.
    pub filename_threshold: f64,
    /// Minimum similarity for two hunk headings to be mapped onto each
    /// other.
    pub heading_threshold: f64,
    /// Diffs with more changed lines than this are never rated; the
    /// comparison is recorded as unknown instead.
    pub max_diff_lines: usize,
    /// Below this shorter/longer line ratio the diff rating is pinned to
    /// zero without inspecting the hunks.
    pub min_line_ratio: f64,
}

impl Default for RaterConfig {
    fn default() -> Self {
        RaterConfig {
            message_diff_weight: 0.3,
            filename_threshold: 0.95,
            heading_threshold: 0.6,
            max_diff_lines: 10_000,
            min_line_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Git repository holding the stacks and the upstream history.
    pub repo: PathBuf,
    /// Directory for the comparison cache and the persisted cluster state.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            repo: PathBuf::from("."),
            state_dir: PathBuf::from(".patchtrack"),
        }
    }
}

/// Immutable run configuration. Constructed once at startup and passed by
/// reference; nothing reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Combined score at or above which two patches are merged into one
    /// equivalence class.
    pub equivalence_threshold: f64,
    /// Candidate pairs must have author dates within this many days of
    /// each other; 0 disables the bound.
    pub window_days: u64,
    /// Size of the rating worker pool; 0 uses one worker per CPU.
    pub workers: usize,
    pub rater: RaterConfig,
    pub paths: PathsConfig,
    /// Named stack snapshots: stack name -> rev range (`base..tip`).
    pub stacks: BTreeMap<String, String>,
    /// Rev range of the upstream history (`base..tip`).
    pub upstream: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            equivalence_threshold: 0.8,
            window_days: 0,
            workers: 0,
            rater: RaterConfig::default(),
            paths: PathsConfig::default(),
            stacks: BTreeMap::new(),
            upstream: None,
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults, so the
    /// tool works out of the box inside a repository.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.paths.state_dir.join("comparisons.json")
    }

    pub fn cluster_path(&self) -> PathBuf {
        self.paths.state_dir.join("clusters.json")
    }

    /// Fingerprint of the constants that determine raw scores. Stored in
    /// the cache file; a mismatch means every cached score is stale.
    pub fn rater_fingerprint(&self) -> String {
        let r = &self.rater;
        fingerprint(&format!(
            "w={};fn={};hd={};max={};minratio={}",
            r.message_diff_weight,
            r.filename_threshold,
            r.heading_threshold,
            r.max_diff_lines,
            r.min_line_ratio
        ))
    }

    /// Fingerprint of the merge policy. Stored in the cluster-state file;
    /// a mismatch triggers a rip-up. Merge decisions derive from raw
    /// scores, so the rater fingerprint is folded in: a rater change
    /// invalidates the partition along with the cache, while a pure
    /// threshold or window change rips up only the partition.
    pub fn cluster_fingerprint(&self) -> String {
        fingerprint(&format!(
            "threshold={};window={};rater={}",
            self.equivalence_threshold,
            self.window_days,
            self.rater_fingerprint()
        ))
    }
}

fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}
