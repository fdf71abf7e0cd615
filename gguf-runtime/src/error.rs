//! Error types for model lifecycle and generation

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load library: {0}")]
    LibraryLoadError(String),

    #[error("FFI error: {0}")]
    FfiError(String),

    #[error("Model is disposed")]
    Disposed,

    #[error("Model is not loaded")]
    NotLoaded,

    #[error("Cannot {operation} while model is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("A model load is in progress; abort it and wait for it to settle first")]
    LoadInProgress,

    #[error("Failed to load model: {0}")]
    ModelLoadError(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Background task was cancelled before completing")]
    TaskCancelled,

    #[error("No async runtime available to schedule background work")]
    NoRuntime,

    #[error("Failed to initialize LoRA adapter \"{0}\"")]
    AdapterInitError(String),

    #[error("Model data is not initialized")]
    ModelDataTornDown,

    #[error("LoRA adapter is already attached")]
    AdapterAlreadyAttached,

    #[error("Failed to tokenize {0}")]
    TokenizeError(String),

    #[error("Failed to create the inference context: {0}")]
    ContextCreationError(String),

    #[error("Failed to initialize sampling subsystem: {0}")]
    SamplerInitError(String),

    #[error("Failed to decode token batch (code {0})")]
    DecodeError(i32),

    #[error("Failed to convert token {0} to piece")]
    PieceConversionError(i32),

    #[error("Prompt too long: {n_prompt} tokens does not fit context size {n_ctx}")]
    PromptTooLong { n_prompt: usize, n_ctx: u32 },

    #[error("Grammar error: {0}")]
    GrammarError(String),

    #[error("Resource accounting underflow: cannot subtract {requested} bytes from {tracked}")]
    AccountingUnderflow { requested: u64, tracked: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<toml::de::Error> for ModelError {
    fn from(e: toml::de::Error) -> Self {
        ModelError::ConfigError(e.to_string())
    }
}
