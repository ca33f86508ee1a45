// Track configuration management for the sandbox
use anyhow::{bail, Context, Result};
use mastery_common::types::Track;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/tracks.json";
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
/// Safety limit to keep pathological submissions out of the sandbox
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024;

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_max_source_bytes() -> usize {
    DEFAULT_MAX_SOURCE_BYTES
}

/// What the bridge does when a call exceeds its timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Interrupt the running code, drop the worker, start a fresh one on the next call.
    /// Sandbox state is lost.
    #[default]
    Respawn,
    /// Stop waiting and leave the worker running.
    Abandon,
}

/// Resource ceilings and identity for the interpreter process.
///
/// Limits apply to every interpreter. The identity switch and the private
/// network/mount namespaces only happen when the service runs as root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLimits {
    /// Address space (RLIMIT_AS)
    pub memory_bytes: u64,
    /// Largest file the interpreter may write (RLIMIT_FSIZE)
    pub file_size_bytes: u64,
    /// Processes and threads for the sandbox user (RLIMIT_NPROC)
    pub max_processes: u64,
    pub open_files: u64,
    /// Total CPU time over the interpreter's lifetime (RLIMIT_CPU)
    pub cpu_seconds: u64,
    /// Size of the private /tmp mounted inside the mount namespace
    pub scratch_bytes: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            file_size_bytes: 16 * 1024 * 1024,
            max_processes: 256,
            open_files: 64,
            cpu_seconds: 600,
            scratch_bytes: 64 * 1024 * 1024,
            // nobody/nogroup
            uid: 65534,
            gid: 65534,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub limits: ProcessLimits,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string(), "-I".to_string()],
            limits: ProcessLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: Track,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterConfig>,
}

impl TrackConfig {
    pub fn builtin(track: Track) -> Self {
        Self {
            name: track,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            on_timeout: TimeoutPolicy::Respawn,
            interpreter: match track {
                Track::Python => Some(InterpreterConfig::default()),
                Track::Sql => None,
            },
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Interpreter to launch, falling back to the default `python3` invocation
    pub fn interpreter(&self) -> InterpreterConfig {
        self.interpreter.clone().unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TracksJson {
    tracks: Vec<TrackConfig>,
}

/// Track configuration manager
#[derive(Debug, Clone)]
pub struct TrackConfigManager {
    configs: HashMap<Track, TrackConfig>,
}

impl TrackConfigManager {
    /// Load track configurations from a tracks.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Track config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read tracks.json")?;

        let tracks_json: TracksJson = serde_json::from_str(&content)
            .context("Failed to parse tracks.json")?;

        let mut configs = HashMap::new();
        for track in tracks_json.tracks {
            if track.call_timeout_ms == 0 {
                bail!("Track '{}' has a zero call_timeout_ms", track.name);
            }
            if configs.insert(track.name, track.clone()).is_some() {
                bail!("Track '{}' is configured more than once", track.name);
            }
        }

        Ok(Self { configs })
    }

    /// Built-in defaults for every track
    pub fn builtin() -> Self {
        let configs = Track::all()
            .into_iter()
            .map(|t| (t, TrackConfig::builtin(t)))
            .collect();
        Self { configs }
    }

    /// Load with default path (config/tracks.json), falling back to built-in defaults
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            info!("No {} found, using built-in track defaults", DEFAULT_CONFIG_PATH);
            Ok(Self::builtin())
        }
    }

    /// Apply MASTERY_PYTHON and MASTERY_CALL_TIMEOUT_MS from the environment
    pub fn with_env_overrides(self) -> Self {
        let python = std::env::var("MASTERY_PYTHON").ok();
        let timeout = std::env::var("MASTERY_CALL_TIMEOUT_MS").ok();
        self.with_overrides(python.as_deref(), timeout.as_deref())
    }

    fn with_overrides(mut self, python: Option<&str>, timeout_ms: Option<&str>) -> Self {
        if let Some(command) = python.filter(|c| !c.trim().is_empty()) {
            let config = self
                .configs
                .entry(Track::Python)
                .or_insert_with(|| TrackConfig::builtin(Track::Python));
            let mut interpreter = config.interpreter();
            interpreter.command = command.trim().to_string();
            config.interpreter = Some(interpreter);
        }

        if let Some(raw) = timeout_ms {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    for config in self.configs.values_mut() {
                        config.call_timeout_ms = ms;
                    }
                }
                _ => warn!("Ignoring invalid MASTERY_CALL_TIMEOUT_MS: {}", raw),
            }
        }

        self
    }

    /// Get configuration for a specific track
    pub fn get_config(&self, track: Track) -> Result<&TrackConfig> {
        self.configs
            .get(&track)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for track: {}", track))
    }

    /// List all configured tracks
    pub fn list_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.configs.keys().copied().collect();
        tracks.sort_by_key(|t| t.as_str());
        tracks
    }
}
