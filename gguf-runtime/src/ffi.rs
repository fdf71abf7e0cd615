//! Low-level FFI bindings to the llama.cpp C API
//!
//! This module provides unsafe bindings to the llama.cpp library.
//! All struct layouts and function signatures match `llama.h` exactly.
//! Symbols are resolved at runtime through `libloading`, so nothing here
//! links against llama.cpp at build time.

use crate::error::{ModelError, Result};
use libloading::Library;
use std::os::raw::{c_char, c_float, c_int, c_void};

/// Opaque pointer to llama_model
#[repr(C)]
pub struct LlamaModel {
    _private: [u8; 0],
}

/// Opaque pointer to llama_vocab
#[repr(C)]
pub struct LlamaVocab {
    _private: [u8; 0],
}

/// Opaque pointer to llama_context
#[repr(C)]
pub struct LlamaContext {
    _private: [u8; 0],
}

/// Opaque pointer to llama_sampler
#[repr(C)]
pub struct LlamaSampler {
    _private: [u8; 0],
}

/// Opaque pointer to llama_adapter_lora
#[repr(C)]
pub struct LlamaAdapterLora {
    _private: [u8; 0],
}

pub type LlamaToken = i32;
pub type LlamaPos = i32;
pub type LlamaSeqId = i32;

pub const LLAMA_TOKEN_NULL: LlamaToken = -1;
pub const LLAMA_DEFAULT_SEED: u32 = 0xFFFF_FFFF;

pub const LLAMA_POOLING_TYPE_RANK: c_int = 4;

pub const LLAMA_FLASH_ATTN_TYPE_DISABLED: c_int = 0;
pub const LLAMA_FLASH_ATTN_TYPE_ENABLED: c_int = 1;

pub const LLAMA_KV_OVERRIDE_TYPE_INT: c_int = 0;
pub const LLAMA_KV_OVERRIDE_TYPE_FLOAT: c_int = 1;
pub const LLAMA_KV_OVERRIDE_TYPE_BOOL: c_int = 2;
pub const LLAMA_KV_OVERRIDE_TYPE_STR: c_int = 3;

/// Size of the fixed key/value buffers in `llama_model_kv_override`
pub const KV_OVERRIDE_BUF_LEN: usize = 128;

pub type LlamaProgressCallback =
    Option<unsafe extern "C" fn(progress: c_float, user_data: *mut c_void) -> bool>;

pub type LlamaLogCallback =
    Option<unsafe extern "C" fn(level: c_int, text: *const c_char, user_data: *mut c_void)>;

#[repr(C)]
#[derive(Copy, Clone)]
pub union LlamaKvOverrideValue {
    pub val_i64: i64,
    pub val_f64: f64,
    pub val_bool: bool,
    pub val_str: [c_char; KV_OVERRIDE_BUF_LEN],
}

/// Matches `llama_model_kv_override`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LlamaModelKvOverride {
    pub tag: c_int,
    pub key: [c_char; KV_OVERRIDE_BUF_LEN],
    pub value: LlamaKvOverrideValue,
}

impl LlamaModelKvOverride {
    /// The empty-key entry that terminates an override list
    pub fn sentinel() -> Self {
        Self {
            tag: LLAMA_KV_OVERRIDE_TYPE_INT,
            key: [0; KV_OVERRIDE_BUF_LEN],
            value: LlamaKvOverrideValue { val_i64: 0 },
        }
    }
}

/// Llama model parameters (matches llama_model_params in C)
#[repr(C)]
#[derive(Debug, Clone)]
pub struct LlamaModelParams {
    pub devices: *mut c_void,
    pub tensor_buft_overrides: *const c_void,
    pub n_gpu_layers: i32,
    pub split_mode: c_int,
    pub main_gpu: i32,
    pub tensor_split: *const c_float,
    pub progress_callback: LlamaProgressCallback,
    pub progress_callback_user_data: *mut c_void,
    pub kv_overrides: *const LlamaModelKvOverride,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub use_extra_bufts: bool,
}

/// Llama context parameters (matches llama_context_params in C)
#[repr(C)]
#[derive(Debug, Clone)]
pub struct LlamaContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub rope_scaling_type: c_int,
    pub pooling_type: c_int,
    pub attention_type: c_int,
    pub flash_attn_type: c_int,
    pub rope_freq_base: c_float,
    pub rope_freq_scale: c_float,
    pub yarn_ext_factor: c_float,
    pub yarn_attn_factor: c_float,
    pub yarn_beta_fast: c_float,
    pub yarn_beta_slow: c_float,
    pub yarn_orig_ctx: u32,
    pub defrag_thold: c_float,
    pub cb_eval: *mut c_void,
    pub cb_eval_user_data: *mut c_void,
    pub type_k: c_int,
    pub type_v: c_int,
    pub abort_callback: *mut c_void,
    pub abort_callback_data: *mut c_void,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub no_perf: bool,
    pub op_offload: bool,
    pub swa_full: bool,
    pub kv_unified: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LlamaSamplerChainParams {
    pub no_perf: bool,
}

/// Batch structure for decoding
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LlamaBatch {
    pub n_tokens: i32,
    pub token: *mut LlamaToken,
    pub embd: *mut c_float,
    pub pos: *mut LlamaPos,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut LlamaSeqId,
    pub logits: *mut i8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LlamaLogitBias {
    pub token: LlamaToken,
    pub bias: c_float,
}

/// FFI function table for llama.cpp, resolved from the shared library
pub struct LlamaFunctions {
    // Backend
    pub llama_backend_init: unsafe extern "C" fn(),
    pub llama_log_set: unsafe extern "C" fn(callback: LlamaLogCallback, user_data: *mut c_void),

    // Model lifecycle
    pub llama_model_default_params: unsafe extern "C" fn() -> LlamaModelParams,
    pub llama_model_load_from_file:
        unsafe extern "C" fn(path: *const c_char, params: LlamaModelParams) -> *mut LlamaModel,
    pub llama_model_free: unsafe extern "C" fn(model: *mut LlamaModel),
    pub llama_model_get_vocab: unsafe extern "C" fn(model: *const LlamaModel) -> *const LlamaVocab,

    // Model info
    pub llama_model_size: unsafe extern "C" fn(model: *const LlamaModel) -> u64,
    pub llama_model_n_params: unsafe extern "C" fn(model: *const LlamaModel) -> u64,
    pub llama_model_n_ctx_train: unsafe extern "C" fn(model: *const LlamaModel) -> i32,
    pub llama_model_n_embd: unsafe extern "C" fn(model: *const LlamaModel) -> i32,
    pub llama_model_desc:
        unsafe extern "C" fn(model: *const LlamaModel, buf: *mut c_char, buf_size: usize) -> i32,

    // Vocabulary
    pub llama_vocab_n_tokens: unsafe extern "C" fn(vocab: *const LlamaVocab) -> i32,
    pub llama_vocab_bos: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_eos: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_eot: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_sep: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_nl: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_fim_pre: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_fim_mid: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_fim_suf: unsafe extern "C" fn(vocab: *const LlamaVocab) -> LlamaToken,
    pub llama_vocab_get_attr:
        unsafe extern "C" fn(vocab: *const LlamaVocab, token: LlamaToken) -> c_int,
    pub llama_vocab_is_eog: unsafe extern "C" fn(vocab: *const LlamaVocab, token: LlamaToken) -> bool,
    pub llama_vocab_get_text:
        unsafe extern "C" fn(vocab: *const LlamaVocab, token: LlamaToken) -> *const c_char,
    pub llama_vocab_type: unsafe extern "C" fn(vocab: *const LlamaVocab) -> c_int,
    pub llama_vocab_get_add_bos: unsafe extern "C" fn(vocab: *const LlamaVocab) -> bool,
    pub llama_vocab_get_add_eos: unsafe extern "C" fn(vocab: *const LlamaVocab) -> bool,

    // Tokenization
    pub llama_tokenize: unsafe extern "C" fn(
        vocab: *const LlamaVocab,
        text: *const c_char,
        text_len: i32,
        tokens: *mut LlamaToken,
        n_tokens_max: i32,
        add_special: bool,
        parse_special: bool,
    ) -> i32,
    pub llama_detokenize: unsafe extern "C" fn(
        vocab: *const LlamaVocab,
        tokens: *const LlamaToken,
        n_tokens: i32,
        text: *mut c_char,
        text_len_max: i32,
        remove_special: bool,
        unparse_special: bool,
    ) -> i32,
    pub llama_token_to_piece: unsafe extern "C" fn(
        vocab: *const LlamaVocab,
        token: LlamaToken,
        buf: *mut c_char,
        length: i32,
        lstrip: i32,
        special: bool,
    ) -> i32,

    // Context
    pub llama_context_default_params: unsafe extern "C" fn() -> LlamaContextParams,
    pub llama_init_from_model:
        unsafe extern "C" fn(model: *mut LlamaModel, params: LlamaContextParams) -> *mut LlamaContext,
    pub llama_free: unsafe extern "C" fn(ctx: *mut LlamaContext),
    pub llama_n_ctx: unsafe extern "C" fn(ctx: *const LlamaContext) -> u32,

    // Decoding
    pub llama_batch_get_one:
        unsafe extern "C" fn(tokens: *mut LlamaToken, n_tokens: i32) -> LlamaBatch,
    pub llama_decode: unsafe extern "C" fn(ctx: *mut LlamaContext, batch: LlamaBatch) -> i32,

    // Sampling
    pub llama_sampler_chain_default_params: unsafe extern "C" fn() -> LlamaSamplerChainParams,
    pub llama_sampler_chain_init:
        unsafe extern "C" fn(params: LlamaSamplerChainParams) -> *mut LlamaSampler,
    pub llama_sampler_chain_add: unsafe extern "C" fn(chain: *mut LlamaSampler, smpl: *mut LlamaSampler),
    pub llama_sampler_init_logit_bias: unsafe extern "C" fn(
        n_vocab: i32,
        n_logit_bias: i32,
        logit_bias: *const LlamaLogitBias,
    ) -> *mut LlamaSampler,
    pub llama_sampler_init_penalties: unsafe extern "C" fn(
        penalty_last_n: i32,
        penalty_repeat: c_float,
        penalty_freq: c_float,
        penalty_present: c_float,
    ) -> *mut LlamaSampler,
    pub llama_sampler_init_dry: unsafe extern "C" fn(
        vocab: *const LlamaVocab,
        n_ctx_train: i32,
        dry_multiplier: c_float,
        dry_base: c_float,
        dry_allowed_length: i32,
        dry_penalty_last_n: i32,
        seq_breakers: *const *const c_char,
        num_breakers: usize,
    ) -> *mut LlamaSampler,
    pub llama_sampler_init_top_n_sigma: unsafe extern "C" fn(n: c_float) -> *mut LlamaSampler,
    pub llama_sampler_init_top_k: unsafe extern "C" fn(k: i32) -> *mut LlamaSampler,
    pub llama_sampler_init_typical: unsafe extern "C" fn(p: c_float, min_keep: usize) -> *mut LlamaSampler,
    pub llama_sampler_init_top_p: unsafe extern "C" fn(p: c_float, min_keep: usize) -> *mut LlamaSampler,
    pub llama_sampler_init_min_p: unsafe extern "C" fn(p: c_float, min_keep: usize) -> *mut LlamaSampler,
    pub llama_sampler_init_xtc:
        unsafe extern "C" fn(p: c_float, t: c_float, min_keep: usize, seed: u32) -> *mut LlamaSampler,
    pub llama_sampler_init_temp_ext:
        unsafe extern "C" fn(t: c_float, delta: c_float, exponent: c_float) -> *mut LlamaSampler,
    pub llama_sampler_init_mirostat: unsafe extern "C" fn(
        n_vocab: i32,
        seed: u32,
        tau: c_float,
        eta: c_float,
        m: i32,
    ) -> *mut LlamaSampler,
    pub llama_sampler_init_mirostat_v2:
        unsafe extern "C" fn(seed: u32, tau: c_float, eta: c_float) -> *mut LlamaSampler,
    pub llama_sampler_init_dist: unsafe extern "C" fn(seed: u32) -> *mut LlamaSampler,
    pub llama_sampler_init_grammar: unsafe extern "C" fn(
        vocab: *const LlamaVocab,
        grammar_str: *const c_char,
        grammar_root: *const c_char,
    ) -> *mut LlamaSampler,
    pub llama_sampler_sample:
        unsafe extern "C" fn(smpl: *mut LlamaSampler, ctx: *mut LlamaContext, idx: i32) -> LlamaToken,
    pub llama_sampler_accept: unsafe extern "C" fn(smpl: *mut LlamaSampler, token: LlamaToken),
    pub llama_sampler_free: unsafe extern "C" fn(smpl: *mut LlamaSampler),

    // LoRA adapters
    pub llama_adapter_lora_init:
        unsafe extern "C" fn(model: *mut LlamaModel, path_lora: *const c_char) -> *mut LlamaAdapterLora,
    pub llama_adapter_lora_free: unsafe extern "C" fn(adapter: *mut LlamaAdapterLora),
}

/// Resolve one symbol from the library, copying out the function pointer
///
/// # Safety
/// `T` must be the exact function pointer type of the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    library.get::<T>(name).map(|s| *s).map_err(|e| {
        let printable = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).to_string();
        ModelError::FfiError(format!("Missing {}: {}", printable, e))
    })
}

impl LlamaFunctions {
    /// Load all required function symbols from the library
    ///
    /// The returned table is only valid while `library` stays loaded; callers
    /// keep the `Library` alive alongside the table.
    pub fn load(library: &Library) -> Result<Self> {
        // SAFETY: We're loading function symbols from a llama.cpp shared library.
        // Each field type matches the C declaration in llama.h, missing symbols
        // propagate as FfiError, and the caller keeps `library` loaded for as
        // long as the table is used.
        unsafe {
            Ok(Self {
                llama_backend_init: symbol(library, b"llama_backend_init\0")?,
                llama_log_set: symbol(library, b"llama_log_set\0")?,

                llama_model_default_params: symbol(library, b"llama_model_default_params\0")?,
                llama_model_load_from_file: symbol(library, b"llama_model_load_from_file\0")?,
                llama_model_free: symbol(library, b"llama_model_free\0")?,
                llama_model_get_vocab: symbol(library, b"llama_model_get_vocab\0")?,

                llama_model_size: symbol(library, b"llama_model_size\0")?,
                llama_model_n_params: symbol(library, b"llama_model_n_params\0")?,
                llama_model_n_ctx_train: symbol(library, b"llama_model_n_ctx_train\0")?,
                llama_model_n_embd: symbol(library, b"llama_model_n_embd\0")?,
                llama_model_desc: symbol(library, b"llama_model_desc\0")?,

                llama_vocab_n_tokens: symbol(library, b"llama_vocab_n_tokens\0")?,
                llama_vocab_bos: symbol(library, b"llama_vocab_bos\0")?,
                llama_vocab_eos: symbol(library, b"llama_vocab_eos\0")?,
                llama_vocab_eot: symbol(library, b"llama_vocab_eot\0")?,
                llama_vocab_sep: symbol(library, b"llama_vocab_sep\0")?,
                llama_vocab_nl: symbol(library, b"llama_vocab_nl\0")?,
                llama_vocab_fim_pre: symbol(library, b"llama_vocab_fim_pre\0")?,
                llama_vocab_fim_mid: symbol(library, b"llama_vocab_fim_mid\0")?,
                llama_vocab_fim_suf: symbol(library, b"llama_vocab_fim_suf\0")?,
                llama_vocab_get_attr: symbol(library, b"llama_vocab_get_attr\0")?,
                llama_vocab_is_eog: symbol(library, b"llama_vocab_is_eog\0")?,
                llama_vocab_get_text: symbol(library, b"llama_vocab_get_text\0")?,
                llama_vocab_type: symbol(library, b"llama_vocab_type\0")?,
                llama_vocab_get_add_bos: symbol(library, b"llama_vocab_get_add_bos\0")?,
                llama_vocab_get_add_eos: symbol(library, b"llama_vocab_get_add_eos\0")?,

                llama_tokenize: symbol(library, b"llama_tokenize\0")?,
                llama_detokenize: symbol(library, b"llama_detokenize\0")?,
                llama_token_to_piece: symbol(library, b"llama_token_to_piece\0")?,

                llama_context_default_params: symbol(library, b"llama_context_default_params\0")?,
                llama_init_from_model: symbol(library, b"llama_init_from_model\0")?,
                llama_free: symbol(library, b"llama_free\0")?,
                llama_n_ctx: symbol(library, b"llama_n_ctx\0")?,

                llama_batch_get_one: symbol(library, b"llama_batch_get_one\0")?,
                llama_decode: symbol(library, b"llama_decode\0")?,

                llama_sampler_chain_default_params: symbol(library, b"llama_sampler_chain_default_params\0")?,
                llama_sampler_chain_init: symbol(library, b"llama_sampler_chain_init\0")?,
                llama_sampler_chain_add: symbol(library, b"llama_sampler_chain_add\0")?,
                llama_sampler_init_logit_bias: symbol(library, b"llama_sampler_init_logit_bias\0")?,
                llama_sampler_init_penalties: symbol(library, b"llama_sampler_init_penalties\0")?,
                llama_sampler_init_dry: symbol(library, b"llama_sampler_init_dry\0")?,
                llama_sampler_init_top_n_sigma: symbol(library, b"llama_sampler_init_top_n_sigma\0")?,
                llama_sampler_init_top_k: symbol(library, b"llama_sampler_init_top_k\0")?,
                llama_sampler_init_typical: symbol(library, b"llama_sampler_init_typical\0")?,
                llama_sampler_init_top_p: symbol(library, b"llama_sampler_init_top_p\0")?,
                llama_sampler_init_min_p: symbol(library, b"llama_sampler_init_min_p\0")?,
                llama_sampler_init_xtc: symbol(library, b"llama_sampler_init_xtc\0")?,
                llama_sampler_init_temp_ext: symbol(library, b"llama_sampler_init_temp_ext\0")?,
                llama_sampler_init_mirostat: symbol(library, b"llama_sampler_init_mirostat\0")?,
                llama_sampler_init_mirostat_v2: symbol(library, b"llama_sampler_init_mirostat_v2\0")?,
                llama_sampler_init_dist: symbol(library, b"llama_sampler_init_dist\0")?,
                llama_sampler_init_grammar: symbol(library, b"llama_sampler_init_grammar\0")?,
                llama_sampler_sample: symbol(library, b"llama_sampler_sample\0")?,
                llama_sampler_accept: symbol(library, b"llama_sampler_accept\0")?,
                llama_sampler_free: symbol(library, b"llama_sampler_free\0")?,

                llama_adapter_lora_init: symbol(library, b"llama_adapter_lora_init\0")?,
                llama_adapter_lora_free: symbol(library, b"llama_adapter_lora_free\0")?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_override_layout() {
        // tag + 128-byte key + 128-byte union, with the union 8-aligned
        assert_eq!(std::mem::size_of::<LlamaKvOverrideValue>(), KV_OVERRIDE_BUF_LEN);
        assert_eq!(std::mem::size_of::<LlamaModelKvOverride>(), 8 + 128 + 128);
    }

    #[test]
    fn test_sentinel_has_empty_key() {
        let sentinel = LlamaModelKvOverride::sentinel();
        assert_eq!(sentinel.key[0], 0);
    }
}
