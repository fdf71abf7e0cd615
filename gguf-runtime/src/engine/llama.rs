//! llama.cpp-backed engine
//!
//! Provides the [`InferenceEngine`] implementation over a llama.cpp shared
//! library resolved at runtime.

use super::{
    ContextParams, InferenceEngine, NativeAdapter, NativeContext, NativeModel, NativeModelParams,
    NativeSampler, ProgressCheckpoint, Token, TokenAttributes, VocabularyType,
};
use crate::error::{ModelError, Result};
use crate::ffi::{
    LlamaAdapterLora, LlamaContext, LlamaFunctions, LlamaKvOverrideValue, LlamaLogitBias,
    LlamaModel, LlamaModelKvOverride, LlamaSampler, LlamaToken, LlamaVocab, KV_OVERRIDE_BUF_LEN,
    LLAMA_FLASH_ATTN_TYPE_DISABLED, LLAMA_FLASH_ATTN_TYPE_ENABLED, LLAMA_KV_OVERRIDE_TYPE_BOOL,
    LLAMA_KV_OVERRIDE_TYPE_FLOAT, LLAMA_KV_OVERRIDE_TYPE_INT, LLAMA_KV_OVERRIDE_TYPE_STR,
    LLAMA_POOLING_TYPE_RANK,
};
use crate::logging::native_log_callback;
use crate::params::{KvOverride, KvOverrideValue};
use crate::sampling::SamplerConfig;
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_float, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

/// Mirostat v1 candidate count used by llama.cpp's common sampler
const MIROSTAT_M: i32 = 100;

/// Engine backed by a dynamically loaded llama.cpp library
pub struct LlamaEngine {
    _library: Arc<Library>, // Keep library alive while function pointers are in use
    functions: LlamaFunctions,
}

impl std::fmt::Debug for LlamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaEngine").finish_non_exhaustive()
    }
}

impl LlamaEngine {
    /// Load the shared library, resolve every symbol and initialise the backend
    ///
    /// # Arguments
    /// * `library_path` - Path to llama.dll, libllama.so, or libllama.dylib
    pub fn open<P: AsRef<Path>>(library_path: P) -> Result<Self> {
        let library_path = library_path.as_ref();

        // SAFETY: Library::new runs the library's initialisers. We only load
        // llama.cpp builds, and every symbol is accessed through typed
        // function pointers resolved in LlamaFunctions::load.
        let library = unsafe {
            Library::new(library_path).map_err(|e| {
                ModelError::LibraryLoadError(format!("Failed to load {}: {}", library_path.display(), e))
            })?
        };
        let library = Arc::new(library);
        let functions = LlamaFunctions::load(&library)?;

        // SAFETY: llama_backend_init is idempotent and must precede model
        // operations. The log callback is a plain function that never unwinds.
        unsafe {
            (functions.llama_backend_init)();
            (functions.llama_log_set)(Some(native_log_callback), std::ptr::null_mut());
        }

        log::info!("Loaded llama.cpp library: {}", library_path.display());
        Ok(Self {
            _library: library,
            functions,
        })
    }

    fn model_ptr(model: NativeModel) -> *mut LlamaModel {
        model.0 as *mut LlamaModel
    }

    fn ctx_ptr(ctx: NativeContext) -> *mut LlamaContext {
        ctx.0 as *mut LlamaContext
    }

    fn sampler_ptr(sampler: NativeSampler) -> *mut LlamaSampler {
        sampler.0 as *mut LlamaSampler
    }

    fn vocab(&self, model: NativeModel) -> *const LlamaVocab {
        // SAFETY: model handles are only produced by load_model and stay valid until free_model
        unsafe { (self.functions.llama_model_get_vocab)(Self::model_ptr(model)) }
    }
}

/// Native progress callback; `user_data` points at the caller's checkpoint
unsafe extern "C" fn progress_trampoline(progress: c_float, user_data: *mut c_void) -> bool {
    if user_data.is_null() {
        return true;
    }
    let checkpoint = &mut *(user_data as *mut ProgressCheckpoint<'_>);
    // A panicking checkpoint aborts the load instead of unwinding through C
    catch_unwind(AssertUnwindSafe(|| checkpoint(progress))).unwrap_or(false)
}

fn copy_c_buf(dst: &mut [c_char; KV_OVERRIDE_BUF_LEN], src: &str) -> bool {
    let bytes = src.as_bytes();
    if bytes.len() >= KV_OVERRIDE_BUF_LEN {
        return false;
    }
    for (d, s) in dst.iter_mut().zip(bytes) {
        *d = *s as c_char;
    }
    dst[bytes.len()] = 0;
    true
}

/// Build the sentinel-terminated override table
fn native_kv_overrides(overrides: &[KvOverride]) -> Vec<LlamaModelKvOverride> {
    let mut table = Vec::with_capacity(overrides.len() + 1);
    for entry in overrides {
        let mut native = LlamaModelKvOverride::sentinel();
        if !copy_c_buf(&mut native.key, &entry.key) {
            log::warn!("Skipping metadata override with oversized key \"{}\"", entry.key);
            continue;
        }
        match &entry.value {
            KvOverrideValue::Int(v) => {
                native.tag = LLAMA_KV_OVERRIDE_TYPE_INT;
                native.value = LlamaKvOverrideValue { val_i64: *v };
            }
            KvOverrideValue::Float(v) => {
                native.tag = LLAMA_KV_OVERRIDE_TYPE_FLOAT;
                native.value = LlamaKvOverrideValue { val_f64: *v };
            }
            KvOverrideValue::Bool(v) => {
                native.tag = LLAMA_KV_OVERRIDE_TYPE_BOOL;
                native.value = LlamaKvOverrideValue { val_bool: *v };
            }
            KvOverrideValue::Str(v) => {
                let mut buf = [0 as c_char; KV_OVERRIDE_BUF_LEN];
                if !copy_c_buf(&mut buf, v) {
                    log::warn!("Skipping metadata override \"{}\": value too long", entry.key);
                    continue;
                }
                native.tag = LLAMA_KV_OVERRIDE_TYPE_STR;
                native.value = LlamaKvOverrideValue { val_str: buf };
            }
        }
        table.push(native);
    }
    table.push(LlamaModelKvOverride::sentinel());
    table
}

impl InferenceEngine for LlamaEngine {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_model(
        &self,
        path: &Path,
        params: &NativeModelParams,
        progress: Option<ProgressCheckpoint<'_>>,
    ) -> Result<Option<NativeModel>> {
        let path_cstr = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|e| ModelError::ModelLoadError(format!("Invalid model path {}: {}", path.display(), e)))?;

        // SAFETY: returns a plain struct by value
        let mut model_params = unsafe { (self.functions.llama_model_default_params)() };
        if let Some(n_gpu_layers) = params.gpu_layers {
            model_params.n_gpu_layers = n_gpu_layers;
        }
        model_params.vocab_only = params.vocab_only;
        model_params.use_mmap = params.use_mmap;
        model_params.use_mlock = params.use_mlock;
        model_params.check_tensors = params.check_tensors;

        let overrides = native_kv_overrides(&params.kv_overrides);
        if overrides.len() > 1 {
            model_params.kv_overrides = overrides.as_ptr();
        }

        // The trampoline receives a pointer to this slot, which outlives the load call
        let mut checkpoint_slot = progress;
        if let Some(checkpoint) = checkpoint_slot.as_mut() {
            model_params.progress_callback = Some(progress_trampoline);
            model_params.progress_callback_user_data = checkpoint as *mut ProgressCheckpoint<'_> as *mut c_void;
        }

        // SAFETY: path_cstr is NUL-terminated, the override table and the
        // checkpoint slot stay alive until the call returns, and a null
        // return is handled below.
        let model_ptr = unsafe { (self.functions.llama_model_load_from_file)(path_cstr.as_ptr(), model_params) };

        if model_ptr.is_null() {
            return Ok(None);
        }
        Ok(Some(NativeModel(model_ptr as usize)))
    }

    fn free_model(&self, model: NativeModel) {
        // SAFETY: handle came from load_model and is freed exactly once by the owner
        unsafe { (self.functions.llama_model_free)(Self::model_ptr(model)) }
    }

    fn model_size(&self, model: NativeModel) -> u64 {
        unsafe { (self.functions.llama_model_size)(Self::model_ptr(model)) }
    }

    fn model_n_params(&self, model: NativeModel) -> u64 {
        unsafe { (self.functions.llama_model_n_params)(Self::model_ptr(model)) }
    }

    fn n_ctx_train(&self, model: NativeModel) -> i32 {
        unsafe { (self.functions.llama_model_n_ctx_train)(Self::model_ptr(model)) }
    }

    fn n_embd(&self, model: NativeModel) -> i32 {
        unsafe { (self.functions.llama_model_n_embd)(Self::model_ptr(model)) }
    }

    fn model_desc(&self, model: NativeModel, out: &mut [u8]) -> i32 {
        // SAFETY: snprintf-style call bounded by out.len()
        unsafe {
            (self.functions.llama_model_desc)(Self::model_ptr(model), out.as_mut_ptr() as *mut c_char, out.len())
        }
    }

    fn n_vocab(&self, model: NativeModel) -> i32 {
        unsafe { (self.functions.llama_vocab_n_tokens)(self.vocab(model)) }
    }

    fn token_bos(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_bos)(self.vocab(model)) }
    }

    fn token_eos(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_eos)(self.vocab(model)) }
    }

    fn token_eot(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_eot)(self.vocab(model)) }
    }

    fn token_sep(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_sep)(self.vocab(model)) }
    }

    fn token_nl(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_nl)(self.vocab(model)) }
    }

    fn token_fim_pre(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_fim_pre)(self.vocab(model)) }
    }

    fn token_fim_mid(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_fim_mid)(self.vocab(model)) }
    }

    fn token_fim_suf(&self, model: NativeModel) -> Token {
        unsafe { (self.functions.llama_vocab_fim_suf)(self.vocab(model)) }
    }

    fn token_attr(&self, model: NativeModel, token: Token) -> TokenAttributes {
        let raw = unsafe { (self.functions.llama_vocab_get_attr)(self.vocab(model), token) };
        TokenAttributes(raw as u32)
    }

    fn token_is_eog(&self, model: NativeModel, token: Token) -> bool {
        unsafe { (self.functions.llama_vocab_is_eog)(self.vocab(model), token) }
    }

    fn token_text(&self, model: NativeModel, token: Token) -> Option<String> {
        if token < 0 || token >= self.n_vocab(model) {
            return None;
        }
        // SAFETY: token is in range; the returned string is owned by the vocab
        unsafe {
            let text = (self.functions.llama_vocab_get_text)(self.vocab(model), token);
            if text.is_null() {
                return None;
            }
            Some(CStr::from_ptr(text).to_string_lossy().into_owned())
        }
    }

    fn vocab_type(&self, model: NativeModel) -> VocabularyType {
        VocabularyType::from_raw(unsafe { (self.functions.llama_vocab_type)(self.vocab(model)) })
    }

    fn add_bos(&self, model: NativeModel) -> bool {
        unsafe { (self.functions.llama_vocab_get_add_bos)(self.vocab(model)) }
    }

    fn add_eos(&self, model: NativeModel) -> bool {
        unsafe { (self.functions.llama_vocab_get_add_eos)(self.vocab(model)) }
    }

    fn tokenize(
        &self,
        model: NativeModel,
        text: &[u8],
        out: &mut [Token],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        // SAFETY: both buffers are passed with their exact lengths
        unsafe {
            (self.functions.llama_tokenize)(
                self.vocab(model),
                text.as_ptr() as *const c_char,
                text.len() as i32,
                out.as_mut_ptr(),
                out.len() as i32,
                add_special,
                parse_special,
            )
        }
    }

    fn detokenize(
        &self,
        model: NativeModel,
        tokens: &[Token],
        out: &mut [u8],
        remove_special: bool,
        unparse_special: bool,
    ) -> i32 {
        unsafe {
            (self.functions.llama_detokenize)(
                self.vocab(model),
                tokens.as_ptr(),
                tokens.len() as i32,
                out.as_mut_ptr() as *mut c_char,
                out.len() as i32,
                remove_special,
                unparse_special,
            )
        }
    }

    fn token_to_piece(
        &self,
        model: NativeModel,
        token: Token,
        out: &mut [u8],
        lstrip: i32,
        special: bool,
    ) -> i32 {
        unsafe {
            (self.functions.llama_token_to_piece)(
                self.vocab(model),
                token,
                out.as_mut_ptr() as *mut c_char,
                out.len() as i32,
                lstrip,
                special,
            )
        }
    }

    fn new_context(&self, model: NativeModel, params: &ContextParams) -> Option<NativeContext> {
        // SAFETY: returns a plain struct by value
        let mut ctx_params = unsafe { (self.functions.llama_context_default_params)() };
        ctx_params.n_ctx = params.n_ctx;
        ctx_params.n_batch = params.n_batch;
        ctx_params.n_seq_max = params.n_seq_max;
        ctx_params.n_threads = params.n_threads;
        ctx_params.n_threads_batch = params.n_threads;
        ctx_params.embeddings = params.embeddings;
        if params.ranking {
            ctx_params.pooling_type = LLAMA_POOLING_TYPE_RANK;
        }
        if let Some(flash) = params.flash_attention {
            ctx_params.flash_attn_type = if flash {
                LLAMA_FLASH_ATTN_TYPE_ENABLED
            } else {
                LLAMA_FLASH_ATTN_TYPE_DISABLED
            };
        }
        ctx_params.no_perf = !params.performance_tracking;

        // SAFETY: model handle is live; null return is mapped to None
        let ctx = unsafe { (self.functions.llama_init_from_model)(Self::model_ptr(model), ctx_params) };
        (!ctx.is_null()).then(|| NativeContext(ctx as usize))
    }

    fn free_context(&self, ctx: NativeContext) {
        unsafe { (self.functions.llama_free)(Self::ctx_ptr(ctx)) }
    }

    fn n_ctx(&self, ctx: NativeContext) -> u32 {
        unsafe { (self.functions.llama_n_ctx)(Self::ctx_ptr(ctx)) }
    }

    fn decode(&self, ctx: NativeContext, tokens: &[Token]) -> i32 {
        // SAFETY: llama_batch_get_one only reads the token buffer, which
        // outlives the decode call.
        unsafe {
            let batch = (self.functions.llama_batch_get_one)(tokens.as_ptr() as *mut LlamaToken, tokens.len() as i32);
            (self.functions.llama_decode)(Self::ctx_ptr(ctx), batch)
        }
    }

    fn new_sampler(&self, model: NativeModel, config: &SamplerConfig) -> Result<NativeSampler> {
        let f = &self.functions;
        let vocab = self.vocab(model);
        let n_vocab = self.n_vocab(model);

        let grammar = config
            .grammar
            .as_deref()
            .map(|g| CString::new(g).map_err(|e| ModelError::GrammarError(e.to_string())))
            .transpose()?;
        let breakers = config
            .dry_sequence_breakers
            .iter()
            .map(|b| CString::new(b.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ModelError::InvalidParameter(format!("DRY sequence breaker: {}", e)))?;
        let breaker_ptrs: Vec<*const c_char> = breakers.iter().map(|b| b.as_ptr()).collect();
        let logit_bias: Vec<LlamaLogitBias> = config
            .logit_bias
            .iter()
            .map(|(token, bias)| LlamaLogitBias { token: *token, bias: *bias })
            .collect();

        // SAFETY: every pointer handed to the sampler constructors stays alive
        // for the duration of the call; the chain takes ownership of each
        // stage it is given and is freed on every error path.
        unsafe {
            let mut chain_params = (f.llama_sampler_chain_default_params)();
            chain_params.no_perf = true;
            let chain = (f.llama_sampler_chain_init)(chain_params);
            if chain.is_null() {
                return Err(ModelError::SamplerInitError("sampler chain".to_string()));
            }

            let add = |stage: *mut LlamaSampler, name: &str| -> Result<()> {
                if stage.is_null() {
                    (f.llama_sampler_free)(chain);
                    return Err(ModelError::SamplerInitError(name.to_string()));
                }
                (f.llama_sampler_chain_add)(chain, stage);
                Ok(())
            };

            if let Some(grammar) = &grammar {
                let stage = (f.llama_sampler_init_grammar)(vocab, grammar.as_ptr(), b"root\0".as_ptr() as *const c_char);
                if stage.is_null() {
                    (f.llama_sampler_free)(chain);
                    return Err(ModelError::GrammarError("Failed to parse grammar".to_string()));
                }
                (f.llama_sampler_chain_add)(chain, stage);
            }

            add(
                (f.llama_sampler_init_logit_bias)(n_vocab, logit_bias.len() as i32, logit_bias.as_ptr()),
                "logit bias",
            )?;

            match config.mirostat {
                0 => {
                    add(
                        (f.llama_sampler_init_penalties)(
                            config.penalty_last_n,
                            config.penalty_repeat,
                            config.penalty_freq,
                            config.penalty_present,
                        ),
                        "penalties",
                    )?;
                    add(
                        (f.llama_sampler_init_dry)(
                            vocab,
                            self.n_ctx_train(model),
                            config.dry_multiplier,
                            config.dry_base,
                            config.dry_allowed_length,
                            config.dry_penalty_last_n,
                            breaker_ptrs.as_ptr(),
                            breaker_ptrs.len(),
                        ),
                        "dry",
                    )?;
                    add((f.llama_sampler_init_top_n_sigma)(config.top_n_sigma), "top-n-sigma")?;
                    add((f.llama_sampler_init_top_k)(config.top_k), "top-k")?;
                    add((f.llama_sampler_init_typical)(config.typical_p, config.min_keep), "typical")?;
                    add((f.llama_sampler_init_top_p)(config.top_p, config.min_keep), "top-p")?;
                    add((f.llama_sampler_init_min_p)(config.min_p, config.min_keep), "min-p")?;
                    add(
                        (f.llama_sampler_init_xtc)(
                            config.xtc_probability,
                            config.xtc_threshold,
                            config.min_keep,
                            config.seed,
                        ),
                        "xtc",
                    )?;
                    add(
                        (f.llama_sampler_init_temp_ext)(
                            config.temperature,
                            config.dynatemp_range,
                            config.dynatemp_exponent,
                        ),
                        "temperature",
                    )?;
                    add((f.llama_sampler_init_dist)(config.seed), "dist")?;
                }
                1 => {
                    add((f.llama_sampler_init_temp_ext)(config.temperature, 0.0, 1.0), "temperature")?;
                    add(
                        (f.llama_sampler_init_mirostat)(
                            n_vocab,
                            config.seed,
                            config.mirostat_tau,
                            config.mirostat_eta,
                            MIROSTAT_M,
                        ),
                        "mirostat",
                    )?;
                }
                _ => {
                    add((f.llama_sampler_init_temp_ext)(config.temperature, 0.0, 1.0), "temperature")?;
                    add(
                        (f.llama_sampler_init_mirostat_v2)(config.seed, config.mirostat_tau, config.mirostat_eta),
                        "mirostat v2",
                    )?;
                }
            }

            Ok(NativeSampler(chain as usize))
        }
    }

    fn sample(&self, sampler: NativeSampler, ctx: NativeContext, idx: i32) -> Token {
        unsafe { (self.functions.llama_sampler_sample)(Self::sampler_ptr(sampler), Self::ctx_ptr(ctx), idx) }
    }

    fn accept(&self, sampler: NativeSampler, token: Token) {
        unsafe { (self.functions.llama_sampler_accept)(Self::sampler_ptr(sampler), token) }
    }

    fn free_sampler(&self, sampler: NativeSampler) {
        unsafe { (self.functions.llama_sampler_free)(Self::sampler_ptr(sampler)) }
    }

    fn adapter_init(&self, model: NativeModel, path: &Path) -> Option<NativeAdapter> {
        let path_cstr = CString::new(path.to_string_lossy().as_bytes()).ok()?;
        // SAFETY: model handle is live, path is NUL-terminated, null is mapped to None
        let adapter = unsafe { (self.functions.llama_adapter_lora_init)(Self::model_ptr(model), path_cstr.as_ptr()) };
        (!adapter.is_null()).then(|| NativeAdapter(adapter as usize))
    }

    fn adapter_free(&self, adapter: NativeAdapter) {
        unsafe { (self.functions.llama_adapter_lora_free)(adapter.0 as *mut LlamaAdapterLora) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_override_table_is_terminated() {
        let overrides = vec![
            KvOverride {
                key: "llama.context_length".to_string(),
                value: KvOverrideValue::Int(8192),
            },
            KvOverride {
                key: "general.name".to_string(),
                value: KvOverrideValue::Str("tiny".to_string()),
            },
        ];
        let table = native_kv_overrides(&overrides);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].tag, LLAMA_KV_OVERRIDE_TYPE_INT);
        assert_eq!(unsafe { table[0].value.val_i64 }, 8192);
        assert_eq!(table[1].tag, LLAMA_KV_OVERRIDE_TYPE_STR);
        assert_eq!(table[2].key[0], 0);
    }

    #[test]
    fn test_trampoline_forwards_and_contains_panics() {
        let mut seen = Vec::new();
        let mut record = |p: f32| {
            seen.push(p);
            p < 0.5
        };
        let mut slot: ProgressCheckpoint<'_> = &mut record;
        let data = &mut slot as *mut ProgressCheckpoint<'_> as *mut c_void;
        unsafe {
            assert!(progress_trampoline(0.25, data));
            assert!(!progress_trampoline(0.75, data));
        }
        assert_eq!(seen, vec![0.25, 0.75]);

        let mut panicking = |_: f32| -> bool { panic!("checkpoint failure") };
        let mut slot: ProgressCheckpoint<'_> = &mut panicking;
        let data = &mut slot as *mut ProgressCheckpoint<'_> as *mut c_void;
        assert!(!unsafe { progress_trampoline(0.1, data) });
    }
}
