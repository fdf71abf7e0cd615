mod common;

use common::{init_logging, loaded, model_with};
use gguf_runtime::{LoraAdapter, MockEngine, ModelError, ModelOptions, ModelState};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_and_detach() {
    init_logging();
    let (engine, model) = loaded(MockEngine::default()).await;
    let adapter = LoraAdapter::new("style.lora.gguf");

    model.attach_adapter(&adapter).unwrap().await.unwrap();
    assert!(adapter.is_attached());
    assert_eq!(engine.live_adapters(), 1);
    assert_eq!(model.adapters().len(), 1);
    assert!(Arc::ptr_eq(&adapter.model().unwrap(), &model));

    assert!(matches!(
        model.attach_adapter(&adapter),
        Err(ModelError::AdapterAlreadyAttached)
    ));

    model.detach_adapter(&adapter).unwrap();
    assert!(!adapter.is_attached());
    assert!(model.adapters().is_empty());
    assert_eq!(engine.live_adapters(), 0);
    assert!(matches!(model.detach_adapter(&adapter), Err(ModelError::InvalidParameter(_))));

    model.dispose().unwrap().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_failure_leaves_adapter_detached() {
    init_logging();
    let (engine, model) = loaded(MockEngine::builder().fail_adapter_init(true).build()).await;
    let adapter = LoraAdapter::new("missing.lora.gguf");

    match model.attach_adapter(&adapter).unwrap().await {
        Err(ModelError::AdapterInitError(path)) => assert!(path.contains("missing.lora.gguf")),
        other => panic!("expected AdapterInitError, got {:?}", other),
    }
    assert!(!adapter.is_attached());
    assert!(model.adapters().is_empty());
    assert_eq!(engine.live_adapters(), 0);

    // A failed attach can be retried
    assert!(matches!(
        model.attach_adapter(&adapter).unwrap().await,
        Err(ModelError::AdapterInitError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_requires_loaded_model() {
    init_logging();
    let engine = Arc::new(MockEngine::default());
    let model = model_with(&engine, ModelOptions::default());
    let adapter = LoraAdapter::new("early.lora.gguf");

    assert!(matches!(model.attach_adapter(&adapter), Err(ModelError::NotLoaded)));
    model.dispose().unwrap().await.unwrap();
    assert!(matches!(model.attach_adapter(&adapter), Err(ModelError::Disposed)));
    assert!(!adapter.is_attached());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_during_attach_tears_adapter_down() {
    init_logging();
    let (engine, model) = loaded(
        MockEngine::builder()
            .adapter_delay(Duration::from_millis(100))
            .build(),
    )
    .await;
    let adapter = LoraAdapter::new("slow.lora.gguf");

    let attaching = model.attach_adapter(&adapter).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let disposing = model.dispose().unwrap();
    assert_eq!(model.state(), ModelState::Disposing);

    assert!(matches!(attaching.await, Err(ModelError::ModelDataTornDown)));
    disposing.await.unwrap();

    assert!(!adapter.is_attached());
    assert_eq!(engine.live_adapters(), 0);
    assert_eq!(engine.live_models(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_frees_attached_adapters() {
    init_logging();
    let (engine, model) = loaded(MockEngine::default()).await;
    let first = LoraAdapter::new("a.lora.gguf");
    let second = LoraAdapter::new("b.lora.gguf");

    let (a, b) = tokio::join!(
        model.attach_adapter(&first).unwrap(),
        model.attach_adapter(&second).unwrap()
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(engine.live_adapters(), 2);
    // Each attached adapter holds the model
    assert_eq!(Arc::strong_count(&model), 3);

    model.dispose().unwrap().await.unwrap();
    assert!(!first.is_attached());
    assert!(!second.is_attached());
    assert_eq!(engine.live_adapters(), 0);
    assert_eq!(engine.live_models(), 0);
    assert_eq!(Arc::strong_count(&model), 1);
}
