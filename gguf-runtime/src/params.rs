//! Model load options and per-call context options

use crate::engine::{ContextParams, NativeModelParams};
use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest key or string value (in bytes) the native override table can hold
pub const KV_OVERRIDE_MAX_LEN: usize = 127;

/// Default context window when the caller does not pick one
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Batch size used when neither the batch nor the context size is given
pub const DEFAULT_BATCH_SIZE: u32 = 2048;

/// Thread count the native library uses when nothing better is known
pub const DEFAULT_THREADS: u32 = 4;

/// Typed value of a GGUF metadata override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KvOverrideValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A single metadata override applied while loading
#[derive(Debug, Clone, PartialEq)]
pub struct KvOverride {
    pub key: String,
    pub value: KvOverrideValue,
}

/// Options fixed at model construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Layers to offload to the GPU (`None` = library default)
    #[serde(alias = "gpuLayers", skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,

    /// Load the vocabulary only (no weights)
    #[serde(alias = "vocabOnly")]
    pub vocab_only: bool,

    #[serde(alias = "useMmap")]
    pub use_mmap: bool,

    #[serde(alias = "useMlock")]
    pub use_mlock: bool,

    /// Validate tensor data while loading
    #[serde(alias = "checkTensors")]
    pub check_tensors: bool,

    #[serde(alias = "kvOverrides")]
    pub kv_overrides: BTreeMap<String, KvOverrideValue>,

    /// Whether `abort_load` is honoured during loading
    #[serde(alias = "hasLoadAbortSignal")]
    pub has_load_abort_signal: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            gpu_layers: None,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            check_tensors: false,
            kv_overrides: BTreeMap::new(),
            has_load_abort_signal: true,
        }
    }
}

impl ModelOptions {
    pub fn with_gpu_layers(mut self, n_layers: i32) -> Self {
        self.gpu_layers = Some(n_layers);
        self
    }

    pub fn with_kv_override(mut self, key: impl Into<String>, value: KvOverrideValue) -> Self {
        self.kv_overrides.insert(key.into(), value);
        self
    }

    /// Build the loader parameters, dropping overrides the native table cannot hold
    pub fn native_params(&self) -> NativeModelParams {
        let kv_overrides = self
            .kv_overrides
            .iter()
            .filter_map(|(key, value)| {
                if key.is_empty() || key.len() > KV_OVERRIDE_MAX_LEN || key.contains('\0') {
                    log::warn!(
                        "Skipping metadata override: key \"{}\" must be 1..={} bytes without NUL",
                        key,
                        KV_OVERRIDE_MAX_LEN
                    );
                    return None;
                }
                if let KvOverrideValue::Str(s) = value {
                    if s.len() > KV_OVERRIDE_MAX_LEN || s.contains('\0') {
                        log::warn!(
                            "Skipping metadata override \"{}\": string value longer than {} bytes",
                            key,
                            KV_OVERRIDE_MAX_LEN
                        );
                        return None;
                    }
                }
                Some(KvOverride {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();

        NativeModelParams {
            gpu_layers: self.gpu_layers,
            vocab_only: self.vocab_only,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            check_tensors: self.check_tensors,
            kv_overrides,
        }
    }
}

/// Per-completion inference context options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Context window in tokens (0 = the model's training context)
    #[serde(alias = "contextSize")]
    pub context_size: u32,

    #[serde(alias = "batchSize", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequences: Option<u32>,

    pub embeddings: bool,

    /// Rank pooling for reranking models
    pub ranking: bool,

    /// `None` leaves the library's automatic choice
    #[serde(alias = "flashAttention", skip_serializing_if = "Option::is_none")]
    pub flash_attention: Option<bool>,

    /// Worker threads (0 = hardware concurrency)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    #[serde(alias = "performanceTracking")]
    pub performance_tracking: bool,

    /// Upper bound on generated tokens; the context budget always applies
    #[serde(alias = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: None,
            sequences: None,
            embeddings: false,
            ranking: false,
            flash_attention: None,
            threads: None,
            performance_tracking: false,
            max_tokens: None,
        }
    }
}

impl ContextOptions {
    pub fn with_context_size(mut self, n_ctx: u32) -> Self {
        self.context_size = n_ctx;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Effective thread count
    pub fn resolved_threads(&self) -> u32 {
        match self.threads {
            Some(n) if n > 0 => n,
            _ => (num_cpus::get() as u32).max(DEFAULT_THREADS),
        }
    }

    pub fn to_context_params(&self) -> Result<ContextParams> {
        if self.batch_size == Some(0) {
            return Err(ModelError::InvalidParameter("batchSize must be positive".to_string()));
        }
        if self.sequences == Some(0) {
            return Err(ModelError::InvalidParameter("sequences must be positive".to_string()));
        }

        let n_ctx = self.context_size;
        Ok(ContextParams {
            n_ctx,
            // Whole prompts are decoded as one batch
            n_batch: self
                .batch_size
                .unwrap_or(if n_ctx == 0 { DEFAULT_BATCH_SIZE } else { n_ctx }),
            n_seq_max: self.sequences.unwrap_or(1),
            n_threads: self.resolved_threads() as i32,
            embeddings: self.embeddings,
            ranking: self.ranking,
            flash_attention: self.flash_attention,
            performance_tracking: self.performance_tracking,
        })
    }
}
