//! GGUF Runtime - asynchronous model lifecycle and generation over llama.cpp
//!
//! This crate drives a native inference library from async Rust: models are
//! loaded and unloaded on blocking worker threads with cooperative abort and
//! coalesced progress reporting, LoRA adapters are attached in the
//! background, and text generation runs either synchronously or as a
//! cancellable stream.
//!
//! # Layout
//!
//! ```text
//! Model ──lease──▶ InferenceEngine ◀── LlamaEngine (libloading + llama.cpp)
//!   │                    ▲          ◀── MockEngine  (in-process, tests)
//!   ├── LoadTask / UnloadTask / AttachTask   (task::queue)
//!   ├── ProgressRelay ──▶ progress callback
//!   ├── ResourceAccountant
//!   └── SamplingSession ──▶ Completion / CompletionStream
//! ```
//!
//! # Example
//!
//! ```no_run
//! use gguf_runtime::{ContextOptions, Model, RuntimeConfig, SamplingParameters};
//!
//! # async fn run() -> gguf_runtime::Result<()> {
//! let config = RuntimeConfig::load(None)?;
//! let engine = config.open_engine()?;
//! let model = Model::builder(engine, "models/tiny.gguf")
//!     .options(config.model.clone())
//!     .on_load_progress(|p| println!("{:.0}%", p * 100.0))
//!     .build();
//!
//! if model.load()?.await? {
//!     let completion = model.completion_sync("Hello", &ContextOptions::default(), &SamplingParameters::greedy())?;
//!     println!("{}", completion.content);
//! }
//! model.dispose()?.await?;
//! # Ok(())
//! # }
//! ```

pub mod accountant;
pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod generation;
pub mod grammar;
pub mod logging;
pub mod model;
pub mod params;
pub mod progress;
pub mod sampling;
pub mod task;

pub use accountant::ResourceAccountant;
pub use adapter::LoraAdapter;
pub use config::RuntimeConfig;
pub use engine::{InferenceEngine, LlamaEngine, MockEngine, Token, TokenAttributes, VocabularyType};
pub use error::{ModelError, Result};
pub use generation::{Completion, CompletionStream};
pub use grammar::{GrammarCompiler, JsonSchemaCompiler};
pub use model::{Model, ModelBuilder, ModelState};
pub use params::{ContextOptions, KvOverrideValue, ModelOptions};
pub use sampling::{LogitBias, LogitBiasEntry, SamplingParameters};
pub use task::PendingResult;

/// Initialize the GGUF runtime library
pub fn init() -> Result<()> {
    log::info!("Initializing gguf-runtime {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
