//! Runtime configuration.
//!
//! Layered as defaults, then an optional TOML (or JSON) file, then
//! environment variables.

use crate::engine::LlamaEngine;
use crate::error::{ModelError, Result};
use crate::params::{ContextOptions, ModelOptions};
use crate::sampling::SamplingParameters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Path of the llama shared library
pub const ENV_LIBRARY: &str = "GGUF_RUNTIME_LIBRARY";
pub const ENV_GPU_LAYERS: &str = "GGUF_RUNTIME_GPU_LAYERS";
pub const ENV_CONTEXT_SIZE: &str = "GGUF_RUNTIME_CONTEXT_SIZE";
pub const ENV_THREADS: &str = "GGUF_RUNTIME_THREADS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// llama shared library (`libllama.so`, `llama.dll`, ...)
    #[serde(alias = "libraryPath", skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,

    pub model: ModelOptions,

    pub context: ContextOptions,

    pub sampling: SamplingParameters,
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .map_err(|e| ModelError::ConfigError(format!("{}: {}", path.display(), e)))
        } else {
            toml::from_str(&content).map_err(|e| ModelError::ConfigError(format!("{}: {}", path.display(), e)))
        }
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self).map_err(|e| ModelError::ConfigError(e.to_string()))?
        } else {
            toml::to_string_pretty(self).map_err(|e| ModelError::ConfigError(e.to_string()))?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`; empty values are ignored
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(library) = get(ENV_LIBRARY) {
            self.library_path = Some(PathBuf::from(library));
        }
        if let Some(layers) = get(ENV_GPU_LAYERS) {
            self.model.gpu_layers = Some(parse_env(ENV_GPU_LAYERS, &layers)?);
        }
        if let Some(size) = get(ENV_CONTEXT_SIZE) {
            self.context.context_size = parse_env(ENV_CONTEXT_SIZE, &size)?;
        }
        if let Some(threads) = get(ENV_THREADS) {
            self.context.threads = Some(parse_env(ENV_THREADS, &threads)?);
        }
        Ok(())
    }

    /// Defaults, then `path` when given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        log::debug!("Runtime configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.context
            .to_context_params()
            .map_err(|e| ModelError::ConfigError(e.to_string()))?;
        if let Some(mirostat) = self.sampling.mirostat {
            if !(0..=2).contains(&mirostat) {
                return Err(ModelError::ConfigError(format!("mirostat must be 0, 1 or 2, got {}", mirostat)));
            }
        }
        Ok(())
    }

    /// Open the configured native library
    pub fn open_engine(&self) -> Result<Arc<LlamaEngine>> {
        let library = self
            .library_path
            .as_deref()
            .ok_or_else(|| ModelError::ConfigError(format!("no library path configured (set {})", ENV_LIBRARY)))?;
        Ok(Arc::new(LlamaEngine::open(library)?))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ModelError::ConfigError(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.library_path.is_none());
        assert!(config.model.use_mmap);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_with_host_option_names() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            libraryPath = "/opt/llama/libllama.so"

            [model]
            gpuLayers = 33
            useMlock = true

            [model.kvOverrides]
            "tokenizer.ggml.add_bos_token" = false

            [context]
            contextSize = 8192
            flashAttention = true

            [sampling]
            temperature = 0.2
            topK = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.library_path, Some(PathBuf::from("/opt/llama/libllama.so")));
        assert_eq!(config.model.gpu_layers, Some(33));
        assert!(config.model.use_mlock);
        assert_eq!(config.model.kv_overrides.len(), 1);
        assert_eq!(config.context.context_size, 8192);
        assert_eq!(config.context.flash_attention, Some(true));
        assert_eq!(config.sampling.temperature, Some(0.2));
        assert_eq!(config.sampling.top_k, Some(20));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LIBRARY, "/tmp/libllama.so"),
            (ENV_GPU_LAYERS, "12"),
            (ENV_CONTEXT_SIZE, " 2048 "),
            (ENV_THREADS, ""),
        ]
        .into_iter()
        .collect();

        let mut config = RuntimeConfig::default();
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.library_path, Some(PathBuf::from("/tmp/libllama.so")));
        assert_eq!(config.model.gpu_layers, Some(12));
        assert_eq!(config.context.context_size, 2048);
        assert_eq!(config.context.threads, None);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env_from(|key| (key == ENV_CONTEXT_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ModelError::ConfigError(msg) if msg.contains(ENV_CONTEXT_SIZE)));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[context]\ncontext_size = 1024\nmax_tokens = 64").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.context.context_size, 1024);
        assert_eq!(config.context.max_tokens, Some(64));

        let json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        config.to_file(json.path()).unwrap();
        assert_eq!(RuntimeConfig::from_file(json.path()).unwrap(), config);
    }

    #[test]
    fn test_malformed_json_file_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{\"context\": ").unwrap();
        let err = RuntimeConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ModelError::ConfigError(_)));
    }

    #[test]
    fn test_missing_library_path() {
        let err = RuntimeConfig::default().open_engine().unwrap_err();
        assert!(matches!(err, ModelError::ConfigError(msg) if msg.contains(ENV_LIBRARY)));
    }
}
