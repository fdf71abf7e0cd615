//! Model handle: lifecycle state machine, metadata queries and tokenizer.
//!
//! A [`Model`] is created unloaded from a path and [`ModelOptions`]. Loading
//! and unloading run as background tasks ([`crate::task`]); everything else
//! is a short synchronous call against the loaded native model.
//!
//! ```text
//! Unloaded ──load──▶ Loading ──ok──▶ Loaded ──dispose──▶ Disposing ──▶ Disposed
//!    │                  │                                                 ▲
//!    │                  └─fail/abort─▶ LoadFailed ──load──▶ Loading       │
//!    └────────────────────────dispose (synchronous)───────────────────────┘
//! ```
//!
//! Every call that touches the native model takes a lease first. Leases can
//! only be taken while the model is loaded, and the unload task waits for
//! outstanding leases to be returned before freeing anything, so a native
//! handle is never freed under a running call.

use crate::accountant::ResourceAccountant;
use crate::adapter::{AttachTask, LoraAdapter};
use crate::engine::{InferenceEngine, NativeModel, Token, TokenAttributes, Vocab, VocabularyType};
use crate::error::{ModelError, Result};
use crate::generation::{self, Completion, CompletionStream};
use crate::grammar::{GrammarCompiler, JsonSchemaCompiler};
use crate::params::{ContextOptions, ModelOptions};
use crate::progress::{ProgressCallback, ProgressPublisher, ProgressRelay};
use crate::sampling::SamplingParameters;
use crate::task::{self, AsyncTask, PendingResult};
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Initial buffer for the model description
const DESCRIPTION_BUF_LEN: usize = 128;

/// Lifecycle state of a [`Model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    LoadFailed,
    Disposing,
    Disposed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
            ModelState::LoadFailed => "load-failed",
            ModelState::Disposing => "disposing",
            ModelState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ModelInner {
    state: ModelState,
    native: Option<NativeModel>,
    /// Bytes added to the accountant for the current load
    loaded_size: u64,
    leases: usize,
}

/// Adapters currently attached to the model.
///
/// Present from construction until dispose begins; an attach that completes
/// after that finds it gone.
#[derive(Default)]
struct ModelData {
    adapters: Vec<Arc<LoraAdapter>>,
}

/// Builder for [`Model`]
pub struct ModelBuilder {
    engine: Arc<dyn InferenceEngine>,
    path: PathBuf,
    options: ModelOptions,
    accountant: Option<Arc<ResourceAccountant>>,
    grammar_compiler: Option<Arc<dyn GrammarCompiler>>,
    on_progress: Option<ProgressCallback>,
}

impl ModelBuilder {
    pub fn options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Share an accountant between models; each model gets its own otherwise
    pub fn accountant(mut self, accountant: Arc<ResourceAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn grammar_compiler(mut self, compiler: Arc<dyn GrammarCompiler>) -> Self {
        self.grammar_compiler = Some(compiler);
        self
    }

    /// Callback for the first load's progress
    pub fn on_load_progress(mut self, callback: impl FnMut(f32) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Arc<Model> {
        let (disposed, _) = watch::channel(false);
        Arc::new(Model {
            engine: self.engine,
            path: self.path,
            options: self.options,
            accountant: self.accountant.unwrap_or_default(),
            grammar_compiler: self
                .grammar_compiler
                .unwrap_or_else(|| Arc::new(JsonSchemaCompiler)),
            inner: Mutex::new(ModelInner {
                state: ModelState::Unloaded,
                native: None,
                loaded_size: 0,
                leases: 0,
            }),
            lease_released: Condvar::new(),
            data: Mutex::new(Some(ModelData::default())),
            abort: Arc::new(AtomicBool::new(false)),
            load_progress: AtomicU32::new(0f32.to_bits()),
            on_progress: Mutex::new(self.on_progress),
            disposed,
        })
    }
}

/// A model file and, once loaded, its native handle
pub struct Model {
    engine: Arc<dyn InferenceEngine>,
    path: PathBuf,
    options: ModelOptions,
    accountant: Arc<ResourceAccountant>,
    grammar_compiler: Arc<dyn GrammarCompiler>,
    inner: Mutex<ModelInner>,
    lease_released: Condvar,
    data: Mutex<Option<ModelData>>,
    abort: Arc<AtomicBool>,
    /// Fractional load progress as `f32` bits
    load_progress: AtomicU32,
    on_progress: Mutex<Option<ProgressCallback>>,
    /// Flips to `true` once the model is disposed
    disposed: watch::Sender<bool>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("engine", &self.engine.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Model {
    pub fn builder(engine: Arc<dyn InferenceEngine>, path: impl Into<PathBuf>) -> ModelBuilder {
        ModelBuilder {
            engine,
            path: path.into(),
            options: ModelOptions::default(),
            accountant: None,
            grammar_compiler: None,
            on_progress: None,
        }
    }

    /// Model with default options and its own accountant
    pub fn new(engine: Arc<dyn InferenceEngine>, path: impl Into<PathBuf>, options: ModelOptions) -> Arc<Self> {
        Self::builder(engine, path).options(options).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn accountant(&self) -> &Arc<ResourceAccountant> {
        &self.accountant
    }

    pub(crate) fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state(), ModelState::Disposing | ModelState::Disposed)
    }

    /// Replace the progress callback used by the next load
    pub fn on_load_progress(&self, callback: impl FnMut(f32) + Send + 'static) {
        *self.on_progress.lock() = Some(Box::new(callback));
    }

    /// Latest fractional progress of the current or last load
    pub fn load_progress(&self) -> f32 {
        f32::from_bits(self.load_progress.load(Ordering::SeqCst))
    }

    /// Latest whole-percent progress of the current or last load
    pub fn load_percentage(&self) -> u32 {
        (self.load_progress() * 100.0).floor() as u32
    }

    /// Bytes tracked for this model while it is loaded
    pub fn model_size(&self) -> u64 {
        self.inner.lock().loaded_size
    }

    /// Start loading the model in the background.
    ///
    /// Valid before the first load and after a failed one. The result is
    /// `true` when the model loaded and `false` when the native loader gave
    /// up, including after [`Model::abort_load`].
    pub fn load(self: &Arc<Self>) -> Result<PendingResult<bool>> {
        let runtime = Handle::try_current().map_err(|_| ModelError::NoRuntime)?;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ModelState::Unloaded | ModelState::LoadFailed => inner.state = ModelState::Loading,
                ModelState::Loading => return Err(ModelError::LoadInProgress),
                ModelState::Disposing | ModelState::Disposed => return Err(ModelError::Disposed),
                state @ ModelState::Loaded => {
                    return Err(ModelError::InvalidState {
                        operation: "load",
                        state: state.as_str(),
                    })
                }
            }
        }
        self.load_progress.store(0f32.to_bits(), Ordering::SeqCst);

        let mut relay = ProgressRelay::new(self.abort.clone(), self.options.has_load_abort_signal);
        if let Some(callback) = self.on_progress.lock().take() {
            relay = relay.with_consumer(&runtime, callback);
        }
        log::info!("Loading model {} with {} engine", self.path.display(), self.engine.name());

        let task = LoadTask {
            model: self.clone(),
            publisher: relay.publisher(),
            relay,
        };
        task::queue(task).inspect_err(|_| {
            self.inner.lock().state = ModelState::LoadFailed;
        })
    }

    /// Ask an in-flight load to stop at its next progress checkpoint.
    ///
    /// The flag stays set until a load completes, so an abort issued before
    /// `load` makes that load give up at its first checkpoint.
    pub fn abort_load(&self) {
        if !self.options.has_load_abort_signal {
            log::warn!("Abort requested for {} but load aborting is disabled", self.path.display());
        }
        self.abort.store(true, Ordering::SeqCst);
        log::debug!("Abort requested for {} ({})", self.path.display(), self.state());
    }

    /// Release the model.
    ///
    /// Disposing a model that was never loaded happens immediately. A loaded
    /// model is unloaded in the background and its tracked size released when
    /// that finishes. Calling again while an unload is running waits for the
    /// same unload; calling after it is a no-op. Disposing while a load is in
    /// flight fails with [`ModelError::LoadInProgress`].
    pub fn dispose(self: &Arc<Self>) -> Result<PendingResult<()>> {
        let mut inner = self.inner.lock();
        match inner.state {
            ModelState::Disposed => Ok(PendingResult::ready(())),
            ModelState::Loading => Err(ModelError::LoadInProgress),
            ModelState::Disposing => {
                let mut disposed = self.disposed.subscribe();
                Ok(PendingResult::from_future(async move {
                    let finished = disposed.wait_for(|done| *done).await;
                    finished.map(|_| ()).map_err(|_| ModelError::TaskCancelled)
                }))
            }
            ModelState::Unloaded | ModelState::LoadFailed => {
                inner.state = ModelState::Disposed;
                drop(inner);
                self.data.lock().take();
                self.disposed.send_replace(true);
                log::debug!("Disposed unloaded model {}", self.path.display());
                Ok(PendingResult::ready(()))
            }
            ModelState::Loaded => {
                if Handle::try_current().is_err() {
                    return Err(ModelError::NoRuntime);
                }
                inner.state = ModelState::Disposing;
                drop(inner);

                let adapters = self.data.lock().take().map(|data| data.adapters).unwrap_or_default();
                log::info!(
                    "Unloading model {} ({} adapters attached)",
                    self.path.display(),
                    adapters.len()
                );
                task::queue(UnloadTask {
                    model: self.clone(),
                    adapters,
                })
            }
        }
    }

    /// Initialise `adapter` against this model in the background
    pub fn attach_adapter(self: &Arc<Self>, adapter: &Arc<LoraAdapter>) -> Result<PendingResult<()>> {
        let lease = self.owned_lease()?;
        if self.data.lock().is_none() {
            return Err(ModelError::ModelDataTornDown);
        }
        adapter.begin_attach()?;
        log::debug!("Attaching adapter {} to {}", adapter.path().display(), self.path.display());

        task::queue(AttachTask::new(lease, adapter.clone())).inspect_err(|_| adapter.cancel_attach())
    }

    /// Detach and free one adapter
    pub fn detach_adapter(&self, adapter: &Arc<LoraAdapter>) -> Result<()> {
        let _lease = self.lease()?;
        let removed = self.data.lock().as_mut().and_then(|data| {
            let index = data.adapters.iter().position(|a| Arc::ptr_eq(a, adapter))?;
            Some(data.adapters.swap_remove(index))
        });
        match removed {
            Some(adapter) => {
                adapter.release();
                log::debug!("Detached adapter {}", adapter.path().display());
                Ok(())
            }
            None => Err(ModelError::InvalidParameter(format!(
                "adapter {} is not attached to this model",
                adapter.path().display()
            ))),
        }
    }

    /// Adapters currently attached
    pub fn adapters(&self) -> Vec<Arc<LoraAdapter>> {
        self.data
            .lock()
            .as_ref()
            .map(|data| data.adapters.clone())
            .unwrap_or_default()
    }

    /// Record a freshly initialised adapter; `false` once dispose has begun
    pub(crate) fn register_adapter(&self, adapter: Arc<LoraAdapter>) -> bool {
        match self.data.lock().as_mut() {
            Some(data) => {
                data.adapters.push(adapter);
                true
            }
            None => false,
        }
    }

    /// Generate text for `prompt` on the calling thread
    pub fn completion_sync(
        &self,
        prompt: &str,
        context: &ContextOptions,
        sampling: &SamplingParameters,
    ) -> Result<Completion> {
        let lease = self.lease()?;
        generation::complete_sync(lease.vocab(), self.grammar_compiler.as_ref(), prompt, context, sampling)
    }

    /// Generate text for `prompt` on a worker thread, streaming pieces as
    /// they are produced. Dropping the stream cancels generation.
    pub fn completion(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        context: ContextOptions,
        sampling: SamplingParameters,
    ) -> Result<CompletionStream> {
        let lease = self.owned_lease()?;
        generation::spawn_completion(lease, self.grammar_compiler.clone(), prompt.into(), context, sampling)
    }

    // Tokenizer

    /// Tokenize without adding BOS; `special_tokens` parses control token text
    pub fn tokenize(&self, text: &str, special_tokens: bool) -> Result<Vec<Token>> {
        let lease = self.lease()?;
        lease.vocab().tokenize(text, false, special_tokens)
    }

    pub fn detokenize(&self, tokens: &[Token], special_tokens: bool) -> Result<String> {
        let lease = self.lease()?;
        let bytes = lease.vocab().detokenize(tokens, false, special_tokens)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Text of a single token, control tokens included
    pub fn detokenize_piece(&self, token: Token) -> Result<String> {
        let lease = self.lease()?;
        let bytes = lease.vocab().token_piece(token, true)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // Metadata

    pub fn train_context_size(&self) -> Result<i32> {
        self.query(|engine, model| engine.n_ctx_train(model))
    }

    pub fn embedding_size(&self) -> Result<i32> {
        self.query(|engine, model| engine.n_embd(model))
    }

    pub fn total_size(&self) -> Result<u64> {
        self.query(|engine, model| engine.model_size(model))
    }

    pub fn total_parameters(&self) -> Result<u64> {
        self.query(|engine, model| engine.model_n_params(model))
    }

    pub fn description(&self) -> Result<String> {
        let lease = self.lease()?;
        let engine = self.engine.as_ref();

        let mut buf = vec![0u8; DESCRIPTION_BUF_LEN];
        let mut len = engine.model_desc(lease.native, &mut buf);
        if len >= 0 && len as usize >= buf.len() {
            buf.resize(len as usize + 1, 0);
            len = engine.model_desc(lease.native, &mut buf);
        }
        if len < 0 {
            return Err(ModelError::FfiError(format!("model description failed with {}", len)));
        }
        buf.truncate((len as usize).min(buf.len()));
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn token_bos(&self) -> Result<Option<Token>> {
        self.query(|engine, model| control_token(engine, model, engine.token_bos(model)))
    }

    pub fn token_eos(&self) -> Result<Option<Token>> {
        self.query(|engine, model| control_token(engine, model, engine.token_eos(model)))
    }

    pub fn token_nl(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_nl(model)))
    }

    pub fn token_eot(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_eot(model)))
    }

    pub fn token_sep(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_sep(model)))
    }

    pub fn prefix_token(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_fim_pre(model)))
    }

    pub fn middle_token(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_fim_mid(model)))
    }

    pub fn suffix_token(&self) -> Result<Option<Token>> {
        self.query(|engine, model| normal_token(engine, model, engine.token_fim_suf(model)))
    }

    /// Raw vocabulary text of `token`
    pub fn token_string(&self, token: Token) -> Result<Option<String>> {
        self.query(|engine, model| engine.token_text(model, token))
    }

    pub fn token_attributes(&self, token: Token) -> Result<TokenAttributes> {
        self.query(|engine, model| engine.token_attr(model, token))
    }

    pub fn is_eog_token(&self, token: Token) -> Result<bool> {
        self.query(|engine, model| engine.token_is_eog(model, token))
    }

    pub fn vocabulary_type(&self) -> Result<VocabularyType> {
        self.query(|engine, model| engine.vocab_type(model))
    }

    pub fn should_prepend_bos(&self) -> Result<bool> {
        self.query(|engine, model| engine.add_bos(model))
    }

    pub fn should_append_eos(&self) -> Result<bool> {
        self.query(|engine, model| engine.add_eos(model))
    }

    fn query<T>(&self, f: impl FnOnce(&dyn InferenceEngine, NativeModel) -> T) -> Result<T> {
        let lease = self.lease()?;
        Ok(f(self.engine.as_ref(), lease.native))
    }

    // Leases

    fn acquire(&self) -> Result<NativeModel> {
        let mut inner = self.inner.lock();
        match (inner.state, inner.native) {
            (ModelState::Loaded, Some(native)) => {
                inner.leases += 1;
                Ok(native)
            }
            (ModelState::Disposing | ModelState::Disposed, _) => Err(ModelError::Disposed),
            _ => Err(ModelError::NotLoaded),
        }
    }

    fn release_lease(&self) {
        let mut inner = self.inner.lock();
        inner.leases = inner.leases.saturating_sub(1);
        if inner.leases == 0 {
            self.lease_released.notify_all();
        }
    }

    pub(crate) fn lease(&self) -> Result<Lease<'_>> {
        let native = self.acquire()?;
        Ok(Lease { model: self, native })
    }

    pub(crate) fn owned_lease(self: &Arc<Self>) -> Result<OwnedLease> {
        let native = self.acquire()?;
        Ok(OwnedLease {
            model: self.clone(),
            native,
        })
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(native) = inner.native.take() {
            log::debug!("Freeing model {} on drop", self.path.display());
            self.engine.free_model(native);
            let size = std::mem::take(&mut inner.loaded_size);
            if let Err(e) = self.accountant.subtract(size) {
                log::warn!("{}", e);
            }
        }
    }
}

/// Short-lived access to the native model
pub(crate) struct Lease<'a> {
    model: &'a Model,
    native: NativeModel,
}

impl<'a> Lease<'a> {
    pub(crate) fn vocab(&self) -> Vocab<'a> {
        Vocab::new(self.model.engine.as_ref(), self.native)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.model.release_lease();
    }
}

/// Lease that keeps the model alive, for work outliving the caller's borrow
pub(crate) struct OwnedLease {
    model: Arc<Model>,
    native: NativeModel,
}

impl OwnedLease {
    pub(crate) fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub(crate) fn native(&self) -> NativeModel {
        self.native
    }

    pub(crate) fn vocab(&self) -> Vocab<'_> {
        Vocab::new(self.model.engine.as_ref(), self.native)
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        self.model.release_lease();
    }
}

/// Special tokens that carry no usable attributes are reported as absent
fn normal_token(engine: &dyn InferenceEngine, model: NativeModel, token: Token) -> Option<Token> {
    if token < 0 {
        return None;
    }
    let attributes = engine.token_attr(model, token);
    if attributes.is_undefined() || attributes.contains(TokenAttributes::UNKNOWN) {
        return None;
    }
    Some(token)
}

/// BOS/EOS must be control tokens unless the vocabulary leaves them undefined
fn control_token(engine: &dyn InferenceEngine, model: NativeModel, token: Token) -> Option<Token> {
    if token < 0 {
        return None;
    }
    let attributes = engine.token_attr(model, token);
    if !attributes.contains(TokenAttributes::CONTROL) && !attributes.is_undefined() {
        return None;
    }
    Some(token)
}

struct LoadTask {
    model: Arc<Model>,
    relay: ProgressRelay,
    publisher: ProgressPublisher,
}

impl AsyncTask for LoadTask {
    type Output = Option<(NativeModel, u64)>;
    type Resolved = bool;

    fn name(&self) -> &'static str {
        "model load"
    }

    fn execute(&mut self) -> Result<Self::Output> {
        let model = &self.model;
        let params = model.options.native_params();
        let publisher = &self.publisher;
        let mut checkpoint = |progress: f32| {
            let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
            // Non-negative f32 bits order like the values
            model.load_progress.fetch_max(progress.to_bits(), Ordering::SeqCst);
            publisher.checkpoint(progress)
        };

        let native = model.engine.load_model(&model.path, &params, Some(&mut checkpoint))?;
        Ok(native.map(|native| (native, model.engine.model_size(native))))
    }

    fn complete(self, outcome: Result<Self::Output>) -> BoxFuture<'static, Result<bool>> {
        let LoadTask { model, relay, .. } = self;
        Box::pin(async move {
            // The progress callback is released here on every path
            relay.finish().await;
            model.abort.store(false, Ordering::SeqCst);

            let loaded = {
                let mut inner = model.inner.lock();
                match outcome {
                    Ok(Some((native, size))) => {
                        inner.state = ModelState::Loaded;
                        inner.native = Some(native);
                        inner.loaded_size = size;
                        Ok(Some(size))
                    }
                    Ok(None) => {
                        inner.state = ModelState::LoadFailed;
                        Ok(None)
                    }
                    Err(e) => {
                        inner.state = ModelState::LoadFailed;
                        Err(e)
                    }
                }
            };

            match loaded {
                Ok(Some(size)) => {
                    model.accountant.add(size);
                    log::info!("Loaded model {} ({} bytes)", model.path.display(), size);
                    Ok(true)
                }
                Ok(None) => {
                    log::warn!("Model {} did not load", model.path.display());
                    Ok(false)
                }
                Err(e) => {
                    log::error!("Loading model {} failed: {}", model.path.display(), e);
                    Err(e)
                }
            }
        })
    }
}

struct UnloadTask {
    model: Arc<Model>,
    adapters: Vec<Arc<LoraAdapter>>,
}

impl AsyncTask for UnloadTask {
    type Output = ();
    type Resolved = ();

    fn name(&self) -> &'static str {
        "model unload"
    }

    fn execute(&mut self) -> Result<()> {
        let model = &self.model;
        let native = {
            let mut inner = model.inner.lock();
            while inner.leases > 0 {
                log::debug!("Unload of {} waiting for {} leases", model.path.display(), inner.leases);
                model.lease_released.wait(&mut inner);
            }
            inner.native.take()
        };

        for adapter in self.adapters.drain(..) {
            adapter.release();
        }
        if let Some(native) = native {
            model.engine.free_model(native);
        }
        Ok(())
    }

    fn complete(self, outcome: Result<()>) -> BoxFuture<'static, Result<()>> {
        let model = self.model;
        Box::pin(async move {
            if let Err(e) = outcome {
                log::warn!("Unload of {} reported {}; treating the model as freed", model.path.display(), e);
            }
            let size = {
                let mut inner = model.inner.lock();
                inner.state = ModelState::Disposed;
                inner.native = None;
                std::mem::take(&mut inner.loaded_size)
            };
            if let Err(e) = model.accountant.subtract(size) {
                log::warn!("{}", e);
            }
            model.disposed.send_replace(true);
            log::info!("Unloaded model {}", model.path.display());
            Ok(())
        })
    }
}
