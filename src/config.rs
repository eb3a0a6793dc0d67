//! Configuration management for extimg.
//!
//! Reads settings from environment variables (a `.env` file is loaded into
//! the environment by `main` first). Command-line flags override them.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::fetch::DEFAULT_SOURCE_PREFIX;
use crate::metadata::DEFAULT_META_LAYER_URL;

/// Run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Transport prefix for the source image (default: `docker-daemon:`)
    pub source_prefix: String,
    /// Where the metadata image's auxiliary layer is downloaded from
    pub meta_layer_url: String,
    /// Directory `build/` is created in
    pub work_dir: PathBuf,
    /// Architecture recorded in `config.json`
    pub architecture: String,
    /// skopeo binary
    pub skopeo: String,
    /// curl binary
    pub curl: String,
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_vars(&vars, cwd)
    }

    /// Build settings from a variable map, falling back to defaults.
    pub fn from_vars(vars: &HashMap<String, String>, cwd: PathBuf) -> Self {
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let work_dir = get("EXTIMG_WORKDIR")
            .map(|s| {
                let path = PathBuf::from(s);
                if path.is_absolute() {
                    path
                } else {
                    cwd.join(path)
                }
            })
            .unwrap_or(cwd);

        Self {
            source_prefix: get("EXTIMG_SOURCE_PREFIX")
                .unwrap_or_else(|| DEFAULT_SOURCE_PREFIX.to_string()),
            meta_layer_url: get("EXTIMG_META_LAYER_URL")
                .unwrap_or_else(|| DEFAULT_META_LAYER_URL.to_string()),
            work_dir,
            architecture: get("EXTIMG_ARCH")
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            skopeo: get("EXTIMG_SKOPEO").unwrap_or_else(|| "skopeo".to_string()),
            curl: get("EXTIMG_CURL").unwrap_or_else(|| "curl".to_string()),
        }
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        tracing::info!(
            source_prefix = %self.source_prefix,
            work_dir = %self.work_dir.display(),
            architecture = %self.architecture,
            meta_layer_url = %self.meta_layer_url,
            "Configuration"
        );
    }
}
