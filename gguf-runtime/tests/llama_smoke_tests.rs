//! Runs against a real llama shared library and model when both are
//! configured through `GGUF_RUNTIME_LIBRARY` and `GGUF_RUNTIME_TEST_MODEL`.

mod common;

use common::init_logging;
use gguf_runtime::config::ENV_LIBRARY;
use gguf_runtime::{ContextOptions, LoraAdapter, Model, ModelOptions, ModelState, RuntimeConfig, SamplingParameters};
use std::path::PathBuf;

const ENV_TEST_MODEL: &str = "GGUF_RUNTIME_TEST_MODEL";

fn smoke_config() -> Option<(RuntimeConfig, PathBuf)> {
    let model = std::env::var(ENV_TEST_MODEL).ok().map(PathBuf::from);
    let library = std::env::var(ENV_LIBRARY).ok();
    match (library, model) {
        (Some(_), Some(model)) if model.exists() => {
            let config = RuntimeConfig::load(None).expect("invalid runtime configuration");
            Some((config, model))
        }
        _ => {
            eprintln!(
                "Warning: {} and {} not set, skipping llama smoke test",
                ENV_LIBRARY, ENV_TEST_MODEL
            );
            None
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_llama_load_generate_dispose() {
    init_logging();
    let Some((config, model_path)) = smoke_config() else {
        return;
    };

    let engine = config.open_engine().expect("failed to open llama library");
    let model = Model::builder(engine, &model_path)
        .options(ModelOptions {
            gpu_layers: Some(0),
            ..config.model.clone()
        })
        .on_load_progress(|p| eprintln!("load progress {:.1}%", p * 100.0))
        .build();

    assert!(model.load().unwrap().await.unwrap(), "model failed to load");
    assert_eq!(model.state(), ModelState::Loaded);
    eprintln!("Loaded {} ({} bytes)", model.description().unwrap(), model.total_size().unwrap());
    assert!(model.train_context_size().unwrap() > 0);
    assert!(model.accountant().total() > 0);

    let tokens = model.tokenize("Once upon a time", false).unwrap();
    assert!(!tokens.is_empty());
    assert_eq!(model.detokenize(&tokens, false).unwrap().trim(), "Once upon a time");

    let context = ContextOptions::default().with_context_size(512).with_max_tokens(16);
    let params = SamplingParameters::greedy().with_seed(42);
    let first = model.completion_sync("Once upon a time", &context, &params).unwrap();
    let second = model.completion_sync("Once upon a time", &context, &params).unwrap();
    eprintln!("Generated: {:?}", first.content);
    assert!(first.tokens_generated > 0);
    assert_eq!(first.content, second.content);

    let streamed = model
        .completion("Once upon a time", context.clone(), params.clone())
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(streamed, first.content);

    if let Ok(lora) = std::env::var("GGUF_RUNTIME_TEST_LORA") {
        let adapter = LoraAdapter::new(lora);
        model.attach_adapter(&adapter).unwrap().await.unwrap();
        assert!(adapter.is_attached());
    }

    model.dispose().unwrap().await.unwrap();
    assert_eq!(model.accountant().total(), 0);
}
