//! Run configuration.
//!
//! A test case directory may carry a `checkrun.yaml` (or `checkrun.toml`)
//! file with defaults for every test case in it. Command-line flags override
//! the file, and the file overrides the built-in defaults.

use crate::error::{Error, Result};
use crate::executor::{Capture, ExecOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file names looked up next to the test case, in order.
pub const CONFIG_FILENAMES: [&str; 2] = ["checkrun.yaml", "checkrun.toml"];

/// Default subject timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Per-directory configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Timeout in seconds for the subject process; 0 disables it.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Merge stderr into the matched output stream (default: true).
    #[serde(default)]
    pub merge_stderr: Option<bool>,

    /// Whether the subject inherits the runner's environment (default: true).
    #[serde(default)]
    pub inherit_env: Option<bool>,

    /// Extra environment variables; values may reference `${VAR}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Settings given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub timeout: Option<u64>,
    pub separate_stderr: bool,
}

/// Load the config file for the directory containing `test_case`.
///
/// Returns `None` if no config file exists, `Err` if one exists but is invalid.
pub fn load_for(test_case: &Path) -> Result<Option<(PathBuf, RunConfig)>> {
    let Some(path) = locate(test_case) else {
        return Ok(None);
    };
    let config = load(&path)?;
    Ok(Some((path, config)))
}

/// Path of the config file that applies to `test_case`, if any.
pub fn locate(test_case: &Path) -> Option<PathBuf> {
    let dir = match test_case.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Load a config file, picking the format from its extension.
pub fn load(path: &Path) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let parsed: std::result::Result<RunConfig, String> = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
        "toml" => toml::from_str(&contents).map_err(|e| e.to_string()),
        other => Err(format!(
            "unsupported file format: {other} (expected .yaml, .yml, or .toml)"
        )),
    };
    let config = parsed.map_err(|message| Error::Config {
        path: path.to_path_buf(),
        message,
    })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Effective executor settings, combining file config and CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub timeout_secs: u64,
    pub capture: Capture,
    pub inherit_env: bool,
    pub env: HashMap<String, String>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            capture: Capture::Merged,
            inherit_env: true,
            env: HashMap::new(),
        }
    }
}

impl EffectiveConfig {
    pub fn resolve(file: Option<(&Path, &RunConfig)>, cli: &CliOverrides) -> Result<Self> {
        let mut effective = Self::default();

        if let Some((path, cfg)) = file {
            if let Some(timeout) = cfg.timeout {
                effective.timeout_secs = timeout;
            }
            if cfg.merge_stderr == Some(false) {
                effective.capture = Capture::Separate;
            }
            if let Some(inherit) = cfg.inherit_env {
                effective.inherit_env = inherit;
            }
            effective.env = resolve_env(&cfg.env).map_err(|message| Error::Config {
                path: path.to_path_buf(),
                message,
            })?;
        }

        if let Some(timeout) = cli.timeout {
            effective.timeout_secs = timeout;
        }
        if cli.separate_stderr {
            effective.capture = Capture::Separate;
        }

        Ok(effective)
    }

    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            capture: self.capture,
            inherit_env: self.inherit_env,
            env: self.env.clone(),
        }
    }
}

/// Expand every configured variable.
///
/// Keys are taken in sorted order, and a `${NAME}` reference sees the keys
/// already expanded before falling back to the runner's environment.
fn resolve_env(
    env: &HashMap<String, String>,
) -> std::result::Result<HashMap<String, String>, String> {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    keys.into_iter().try_fold(HashMap::with_capacity(env.len()), |mut done, key| {
        let value = expand_vars(&env[key], &done)?;
        done.insert(key.clone(), value);
        Ok(done)
    })
}

fn expand_vars(
    value: &str,
    known: &HashMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let end = body
            .find('}')
            .ok_or_else(|| format!("unterminated `${{` in {value:?}"))?;
        let name = &body[..end];
        match known.get(name) {
            Some(v) => out.push_str(v),
            None => {
                let v = std::env::var(name)
                    .map_err(|_| format!("environment variable '{name}' is not set"))?;
                out.push_str(&v);
            }
        }
        rest = &body[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
