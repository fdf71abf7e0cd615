//! Inference engine interface.
//!
//! This module defines the trait that abstracts the native inference library
//! (model loading, vocabulary, tokenizer, decode and sampling). The production
//! implementation lives in [`llama`] and talks to llama.cpp through a
//! dynamically loaded function table; [`mock`] is a deterministic in-process
//! engine for tests and development without a shared library.
//!
//! # Handles
//!
//! Native objects cross the seam as opaque pointer-sized handles. A handle is
//! only meaningful to the engine that produced it and must not be used after
//! the matching `free_*` call.
//!
//! # Size-probe convention
//!
//! `tokenize`, `detokenize` and `token_to_piece` follow the two-call idiom of
//! the native library: when `out` is too small (including empty), nothing
//! useful is written and the call returns the required length **negated**.
//! Callers probe with an empty buffer, negate the result, allocate, and call
//! again. A non-negative return is the number of elements written.

pub mod llama;
pub mod mock;

use crate::error::{ModelError, Result};
use crate::params::KvOverride;
use crate::sampling::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use llama::LlamaEngine;
pub use mock::{MockEngine, MockEngineBuilder};

/// Token id in the model vocabulary
pub type Token = i32;

/// Sentinel for "no such token"
pub const TOKEN_NULL: Token = -1;

/// Opaque handle to a loaded native model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeModel(pub usize);

/// Opaque handle to a native inference context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeContext(pub usize);

/// Opaque handle to a native sampler chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeSampler(pub usize);

/// Opaque handle to a native LoRA adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeAdapter(pub usize);

/// Parameters passed to the native model loader
#[derive(Debug, Clone, Default)]
pub struct NativeModelParams {
    /// Number of layers to offload to the GPU (`None` keeps the library default)
    pub gpu_layers: Option<i32>,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    /// Metadata overrides, already validated against the native size limits
    pub kv_overrides: Vec<KvOverride>,
}

/// Parameters for creating an inference context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Context window in tokens (0 = model training context)
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub embeddings: bool,
    /// Use rank pooling (reranking models)
    pub ranking: bool,
    /// `None` = let the library decide
    pub flash_attention: Option<bool>,
    /// Collect native performance counters
    pub performance_tracking: bool,
}

/// Token attribute bit set as reported by the vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TokenAttributes(pub u32);

impl TokenAttributes {
    pub const UNDEFINED: u32 = 0;
    pub const UNKNOWN: u32 = 1 << 0;
    pub const UNUSED: u32 = 1 << 1;
    pub const NORMAL: u32 = 1 << 2;
    pub const CONTROL: u32 = 1 << 3;
    pub const USER_DEFINED: u32 = 1 << 4;
    pub const BYTE: u32 = 1 << 5;
    pub const NORMALIZED: u32 = 1 << 6;
    pub const LSTRIP: u32 = 1 << 7;
    pub const RSTRIP: u32 = 1 << 8;
    pub const SINGLE_WORD: u32 = 1 << 9;

    pub fn is_undefined(self) -> bool {
        self.0 == Self::UNDEFINED
    }

    pub fn contains(self, flag: u32) -> bool {
        flag != 0 && self.0 & flag == flag
    }

    /// Names of the set flags, lowest bit first
    pub fn names(self) -> Vec<&'static str> {
        const NAMES: [(u32, &str); 10] = [
            (TokenAttributes::UNKNOWN, "unknown"),
            (TokenAttributes::UNUSED, "unused"),
            (TokenAttributes::NORMAL, "normal"),
            (TokenAttributes::CONTROL, "control"),
            (TokenAttributes::USER_DEFINED, "userDefined"),
            (TokenAttributes::BYTE, "byte"),
            (TokenAttributes::NORMALIZED, "normalized"),
            (TokenAttributes::LSTRIP, "lstrip"),
            (TokenAttributes::RSTRIP, "rstrip"),
            (TokenAttributes::SINGLE_WORD, "singleWord"),
        ];
        if self.is_undefined() {
            return vec!["undefined"];
        }
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Tokenizer family of the vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VocabularyType {
    None,
    Spm,
    Bpe,
    Wpm,
    Ugm,
    Rwkv,
    Plamo2,
}

impl VocabularyType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Spm,
            2 => Self::Bpe,
            3 => Self::Wpm,
            4 => Self::Ugm,
            5 => Self::Rwkv,
            6 => Self::Plamo2,
            _ => Self::None,
        }
    }
}

/// Progress checkpoint invoked by the loader with a fraction in `[0, 1]`.
/// Returning `false` asks the loader to abort.
pub type ProgressCheckpoint<'a> = &'a mut dyn FnMut(f32) -> bool;

/// Interface to a native inference library.
///
/// Implementations must be callable from worker threads; every method may
/// block for as long as the native call takes.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Short engine name for logs
    fn name(&self) -> &str;

    /// Load a model file.
    ///
    /// `Ok(None)` means the native loader returned no model, which includes
    /// the case where `progress` returned `false`.
    fn load_model(
        &self,
        path: &Path,
        params: &NativeModelParams,
        progress: Option<ProgressCheckpoint<'_>>,
    ) -> Result<Option<NativeModel>>;

    fn free_model(&self, model: NativeModel);

    /// Bytes occupied by the model weights
    fn model_size(&self, model: NativeModel) -> u64;
    fn model_n_params(&self, model: NativeModel) -> u64;
    fn n_ctx_train(&self, model: NativeModel) -> i32;
    fn n_embd(&self, model: NativeModel) -> i32;

    /// Write the model description into `out` (NUL-terminated when it fits)
    /// and return its full length in bytes, excluding the terminator.
    fn model_desc(&self, model: NativeModel, out: &mut [u8]) -> i32;

    fn n_vocab(&self, model: NativeModel) -> i32;
    fn token_bos(&self, model: NativeModel) -> Token;
    fn token_eos(&self, model: NativeModel) -> Token;
    fn token_eot(&self, model: NativeModel) -> Token;
    fn token_sep(&self, model: NativeModel) -> Token;
    fn token_nl(&self, model: NativeModel) -> Token;
    fn token_fim_pre(&self, model: NativeModel) -> Token;
    fn token_fim_mid(&self, model: NativeModel) -> Token;
    fn token_fim_suf(&self, model: NativeModel) -> Token;
    fn token_attr(&self, model: NativeModel, token: Token) -> TokenAttributes;
    fn token_is_eog(&self, model: NativeModel, token: Token) -> bool;
    fn token_text(&self, model: NativeModel, token: Token) -> Option<String>;
    fn vocab_type(&self, model: NativeModel) -> VocabularyType;
    fn add_bos(&self, model: NativeModel) -> bool;
    fn add_eos(&self, model: NativeModel) -> bool;

    /// Tokenize `text` into `out` (size-probe convention)
    fn tokenize(
        &self,
        model: NativeModel,
        text: &[u8],
        out: &mut [Token],
        add_special: bool,
        parse_special: bool,
    ) -> i32;

    /// Render `tokens` into `out` (size-probe convention)
    fn detokenize(
        &self,
        model: NativeModel,
        tokens: &[Token],
        out: &mut [u8],
        remove_special: bool,
        unparse_special: bool,
    ) -> i32;

    /// Render a single token into `out` (size-probe convention)
    fn token_to_piece(
        &self,
        model: NativeModel,
        token: Token,
        out: &mut [u8],
        lstrip: i32,
        special: bool,
    ) -> i32;

    fn new_context(&self, model: NativeModel, params: &ContextParams) -> Option<NativeContext>;
    fn free_context(&self, ctx: NativeContext);
    fn n_ctx(&self, ctx: NativeContext) -> u32;

    /// Decode a batch of tokens appended after the tokens already in `ctx`.
    /// Returns 0 on success and a native status code otherwise.
    fn decode(&self, ctx: NativeContext, tokens: &[Token]) -> i32;

    fn new_sampler(&self, model: NativeModel, config: &SamplerConfig) -> Result<NativeSampler>;
    /// Sample from the logits at `idx` of the last decoded batch (-1 = last)
    fn sample(&self, sampler: NativeSampler, ctx: NativeContext, idx: i32) -> Token;
    fn accept(&self, sampler: NativeSampler, token: Token);
    fn free_sampler(&self, sampler: NativeSampler);

    fn adapter_init(&self, model: NativeModel, path: &Path) -> Option<NativeAdapter>;
    fn adapter_free(&self, adapter: NativeAdapter);
}

/// Vocabulary view over a loaded model.
///
/// Wraps the size-probe calls of [`InferenceEngine`] into owned results.
#[derive(Clone, Copy)]
pub struct Vocab<'a> {
    engine: &'a dyn InferenceEngine,
    model: NativeModel,
}

impl<'a> Vocab<'a> {
    pub fn new(engine: &'a dyn InferenceEngine, model: NativeModel) -> Self {
        Self { engine, model }
    }

    pub fn engine(&self) -> &'a dyn InferenceEngine {
        self.engine
    }

    pub fn model(&self) -> NativeModel {
        self.model
    }

    pub fn n_vocab(&self) -> i32 {
        self.engine.n_vocab(self.model)
    }

    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>> {
        let probe = self
            .engine
            .tokenize(self.model, text.as_bytes(), &mut [], add_special, parse_special);
        // An empty result is reported as 0 rather than as a negated size
        let required = if probe < 0 { -(probe as i64) } else { probe as i64 };
        if required == 0 {
            return Ok(Vec::new());
        }

        let mut tokens = vec![0 as Token; required as usize];
        let written = self
            .engine
            .tokenize(self.model, text.as_bytes(), &mut tokens, add_special, parse_special);
        if written < 0 {
            return Err(ModelError::TokenizeError(format!("\"{}\"", text)));
        }
        tokens.truncate(written as usize);
        Ok(tokens)
    }

    pub fn detokenize(&self, tokens: &[Token], remove_special: bool, unparse_special: bool) -> Result<Vec<u8>> {
        // Start with a guess and let the size probe correct it
        let mut buf = vec![0u8; tokens.len() * 8 + 16];
        let mut n = self
            .engine
            .detokenize(self.model, tokens, &mut buf, remove_special, unparse_special);
        if n < 0 {
            buf.resize((-(n as i64)) as usize, 0);
            n = self
                .engine
                .detokenize(self.model, tokens, &mut buf, remove_special, unparse_special);
            if n < 0 {
                return Err(ModelError::TokenizeError(format!("{} tokens back to text", tokens.len())));
            }
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// Bytes of a single token; multi-byte characters may span tokens
    pub fn token_piece(&self, token: Token, special: bool) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 128];
        let mut n = self.engine.token_to_piece(self.model, token, &mut buf, 0, special);
        if n < 0 {
            buf.resize((-(n as i64)) as usize, 0);
            n = self.engine.token_to_piece(self.model, token, &mut buf, 0, special);
            if n < 0 {
                return Err(ModelError::PieceConversionError(token));
            }
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    pub fn is_eog(&self, token: Token) -> bool {
        self.engine.token_is_eog(self.model, token)
    }

    /// Every end-of-generation token in the vocabulary
    pub fn eog_tokens(&self) -> Vec<Token> {
        (0..self.n_vocab()).filter(|t| self.is_eog(*t)).collect()
    }

    pub fn has_eos(&self) -> bool {
        self.engine.token_eos(self.model) != TOKEN_NULL
    }
}
