#![allow(dead_code)]

use gguf_runtime::{MockEngine, Model, ModelOptions};
use std::sync::Arc;

pub const MODEL_PATH: &str = "tiny-mock.gguf";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn model_with(engine: &Arc<MockEngine>, options: ModelOptions) -> Arc<Model> {
    Model::builder(engine.clone(), MODEL_PATH).options(options).build()
}

/// Mock engine plus a model that has finished loading
pub async fn loaded(engine: MockEngine) -> (Arc<MockEngine>, Arc<Model>) {
    let engine = Arc::new(engine);
    let model = model_with(&engine, ModelOptions::default());
    assert!(model.load().unwrap().await.unwrap(), "mock model failed to load");
    (engine, model)
}

/// Counts how often the wrapped value is dropped
pub struct DropCounter(pub Arc<std::sync::atomic::AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
