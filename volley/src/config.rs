//! Loading the engine configuration and job descriptions from disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use volley_common::{address::parse_recipient_list, internal};
use volley_dispatch::{DispatchConfig, SubmitRequest, parse_relays};

const CONFIG_ENV: &str = "VOLLEY_CONFIG";

fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from("./volley.config.ron"),
        PathBuf::from("/etc/volley/volley.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. `explicit` (the `--config` flag)
/// 2. `VOLLEY_CONFIG` environment variable
/// 3. ./volley.config.ron (current working directory)
/// 4. /etc/volley/volley.config.ron (system-wide config)
///
/// `Ok(None)` means no file was found and the built-in defaults apply.
///
/// # Errors
///
/// If the flag or the environment variable names a file that does not
/// exist.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let env = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    locate(explicit, env, &default_paths())
}

fn locate(
    explicit: Option<&Path>,
    env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        anyhow::bail!("Configuration file {} does not exist", path.display());
    }

    if let Some(path) = env {
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}

/// Reads the engine configuration, or the defaults if there is none.
///
/// # Errors
///
/// If the file cannot be read or is not valid RON.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<DispatchConfig> {
    let Some(path) = find_config_file(explicit)? else {
        internal!(level = INFO, "No configuration file found, using defaults");
        return Ok(DispatchConfig::default());
    };

    internal!(level = INFO, "Loading configuration from {}", path.display());
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    ron::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Overrides applied on top of a job file
#[derive(Debug, Default)]
pub struct JobOverrides<'a> {
    pub recipients: Option<&'a Path>,
    pub relays: Option<&'a Path>,
    pub workers: Option<i64>,
}

/// Reads a job description and applies the command line overrides.
///
/// A recipient list replaces the job's recipients; lines that are not
/// valid addresses are dropped with a warning.
///
/// # Errors
///
/// If a file cannot be read, the job is not valid RON, or the relays file
/// has a malformed line.
pub fn load_job(path: &Path, overrides: &JobOverrides<'_>) -> anyhow::Result<SubmitRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job from {}", path.display()))?;
    let mut request: SubmitRequest =
        ron::from_str(&content).with_context(|| format!("Invalid job in {}", path.display()))?;

    if let Some(list) = overrides.recipients {
        let text = std::fs::read_to_string(list)
            .with_context(|| format!("Failed to read recipients from {}", list.display()))?;
        let parsed = parse_recipient_list(&text);

        if !parsed.invalid.is_empty() {
            tracing::warn!(
                "Dropped {} invalid recipients from {}",
                parsed.invalid.len(),
                list.display()
            );
        }
        request.recipients = parsed.valid;
    }

    if let Some(file) = overrides.relays {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read relays from {}", file.display()))?;
        request.relay_credentials = parse_relays(&text).map_err(|(line, e)| {
            anyhow::anyhow!("{}:{line}: {e}", file.display())
        })?;
    }

    if let Some(workers) = overrides.workers {
        request.worker_count = workers;
    }

    Ok(request)
}
