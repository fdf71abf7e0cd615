mod common;

use common::{init_logging, loaded};
use futures::StreamExt;
use gguf_runtime::engine::mock::MOCK_EOS;
use gguf_runtime::{
    ContextOptions, LogitBias, LogitBiasEntry, MockEngine, Model, ModelError, ModelOptions, SamplingParameters,
};
use proptest::prelude::*;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;

fn shared_model() -> &'static Arc<Model> {
    static MODEL: OnceLock<(Runtime, Arc<Model>)> = OnceLock::new();
    &MODEL
        .get_or_init(|| {
            let runtime = Runtime::new().unwrap();
            let model = runtime.block_on(async {
                let model = Model::new(Arc::new(MockEngine::default()), "shared.gguf", ModelOptions::default());
                assert!(model.load().unwrap().await.unwrap());
                model
            });
            (runtime, model)
        })
        .1
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_greedy_generation_is_deterministic() {
    init_logging();
    let (engine, model) = loaded(MockEngine::default()).await;
    let params = SamplingParameters::greedy().with_seed(7);

    let first = model.completion_sync("Hello", &ContextOptions::default(), &params).unwrap();
    let second = model.completion_sync("Hello", &ContextOptions::default(), &params).unwrap();
    assert_eq!(first.content, " world!");
    assert_eq!(first.content, second.content);
    assert_eq!(first.tokens_generated, 2);
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.live_samplers(), 0);

    model.dispose().unwrap().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seeded_sampling_repeats() {
    init_logging();
    let (_engine, model) = loaded(MockEngine::builder().script("").build()).await;
    let params = SamplingParameters {
        temperature: Some(1.5),
        top_k: Some(20),
        ..SamplingParameters::default()
    }
    .with_seed(1234)
    .with_ignore_eos(true);
    let context = ContextOptions::default().with_max_tokens(12);

    let first = model.completion_sync("Hello", &context, &params).unwrap();
    let second = model.completion_sync("Hello", &context, &params).unwrap();
    assert_eq!(first.tokens_generated, 12);
    assert_eq!(first.content, second.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grammar_forces_single_token() {
    init_logging();
    let (_engine, model) = loaded(MockEngine::default()).await;
    let params = SamplingParameters::greedy().with_grammar(r#"root ::= "yes""#);

    let completion = model
        .completion_sync("Hello", &ContextOptions::default(), &params)
        .unwrap();
    assert_eq!(completion.content, "yes");
    assert_eq!(completion.tokens_generated, 1);
    assert_eq!(completion.params.grammar.as_deref(), Some(r#"root ::= "yes""#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ignore_eos_runs_to_bound() {
    init_logging();
    let (_engine, model) = loaded(MockEngine::builder().script("").build()).await;
    let context = ContextOptions::default().with_max_tokens(16);

    let stops = model
        .completion_sync("Hello", &context, &SamplingParameters::greedy())
        .unwrap();
    assert_eq!(stops.tokens_generated, 0);
    assert_eq!(stops.content, "");

    let params = SamplingParameters::greedy().with_ignore_eos(true);
    let runs = model.completion_sync("Hello", &context, &params).unwrap();
    assert_eq!(runs.tokens_generated, 16);
    assert!(!runs.content.contains("</s>"));
    assert_eq!(runs.params.ignore_eos, Some(true));

    // The bias list carries every end-of-generation token
    match runs.params.logit_bias {
        Some(LogitBias::List(entries)) => {
            assert!(entries.iter().all(|e| e.bias == f32::NEG_INFINITY));
            assert_eq!(entries.len(), 2);
        }
        other => panic!("expected logit bias list, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logit_bias_by_text() {
    init_logging();
    let (_engine, model) = loaded(MockEngine::default()).await;
    let params = SamplingParameters {
        logit_bias: Some(LogitBias::List(vec![LogitBiasEntry {
            token: " world".to_string(),
            bias: -100.0,
        }])),
        ..SamplingParameters::greedy()
    };

    let completion = model
        .completion_sync("Hello", &ContextOptions::default().with_max_tokens(4), &params)
        .unwrap();
    assert!(!completion.content.starts_with(" world"));
    match completion.params.logit_bias {
        Some(LogitBias::List(entries)) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].token, " world");
            assert_eq!(entries[0].bias, -100.0);
        }
        other => panic!("expected logit bias list, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_native_resources_released_on_errors() {
    init_logging();

    let (engine, model) = loaded(MockEngine::builder().fail_decode_after(2).build()).await;
    let err = model
        .completion_sync("Hello", &ContextOptions::default(), &SamplingParameters::greedy().with_ignore_eos(true))
        .unwrap_err();
    assert!(matches!(err, ModelError::DecodeError(-3)));
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.live_samplers(), 0);

    let (engine, model) = loaded(MockEngine::builder().fail_context(true).build()).await;
    let err = model
        .completion_sync("Hello", &ContextOptions::default(), &SamplingParameters::greedy())
        .unwrap_err();
    assert!(matches!(err, ModelError::ContextCreationError(_)));
    assert_eq!(engine.live_samplers(), 0);

    let (engine, model) = loaded(MockEngine::default()).await;
    let err = model
        .completion_sync("Hello", &ContextOptions::default(), &SamplingParameters::greedy().with_grammar("root ::= yes"))
        .unwrap_err();
    assert!(matches!(err, ModelError::GrammarError(_)));
    assert_eq!(engine.live_contexts(), 0);

    let err = model
        .completion_sync(
            "Hello",
            &ContextOptions::default(),
            &SamplingParameters {
                mirostat: Some(3),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidParameter(_)));

    let err = model
        .completion_sync("Hello there", &ContextOptions::default().with_context_size(3), &SamplingParameters::greedy())
        .unwrap_err();
    assert!(matches!(err, ModelError::PromptTooLong { n_prompt: 3, n_ctx: 3 }));
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.live_samplers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_completion() {
    init_logging();
    let (engine, model) = loaded(MockEngine::default()).await;

    let stream = model
        .completion("Hello", ContextOptions::default(), SamplingParameters::greedy())
        .unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), " world!");

    // The lease is returned once the worker finishes
    model.dispose().unwrap().await.unwrap();
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.live_models(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_cancellation_releases_model() {
    init_logging();
    let (engine, model) = loaded(
        MockEngine::builder()
            .script("")
            .decode_delay(Duration::from_millis(10))
            .build(),
    )
    .await;

    let mut stream = model
        .completion(
            "Hello",
            ContextOptions::default(),
            SamplingParameters::greedy().with_ignore_eos(true),
        )
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(stream);

    // Dispose waits for the cancelled worker to hand back its lease
    tokio::time::timeout(Duration::from_secs(5), model.dispose().unwrap())
        .await
        .expect("dispose did not finish after cancellation")
        .unwrap();
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.live_samplers(), 0);
    assert_eq!(engine.live_models(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_reports_errors() {
    init_logging();
    let (_engine, model) = loaded(MockEngine::builder().fail_context(true).build()).await;
    let mut stream = model
        .completion("Hello", ContextOptions::default(), SamplingParameters::greedy())
        .unwrap();
    assert!(matches!(stream.next().await, Some(Err(ModelError::ContextCreationError(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_requires_loaded_model() {
    init_logging();
    let model = Model::new(Arc::new(MockEngine::default()), "idle.gguf", ModelOptions::default());
    assert!(matches!(
        model.completion("Hello", ContextOptions::default(), SamplingParameters::default()),
        Err(ModelError::NotLoaded)
    ));
    model.dispose().unwrap().await.unwrap();
    assert!(matches!(
        model.completion_sync("Hello", &ContextOptions::default(), &SamplingParameters::default()),
        Err(ModelError::Disposed)
    ));
}

#[test]
fn test_tokenizer_surface() {
    init_logging();
    let model = shared_model();

    let tokens = model.tokenize("Hello world", false).unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(model.detokenize(&tokens, false).unwrap(), "Hello world");
    assert_eq!(model.detokenize_piece(tokens[1]).unwrap(), " world");

    // Control token text is only parsed when asked to
    assert_eq!(model.tokenize("</s>", true).unwrap(), vec![MOCK_EOS]);
    assert_eq!(model.tokenize("</s>", false).unwrap().len(), 4);
    assert_eq!(model.detokenize(&[MOCK_EOS], false).unwrap(), "");
    assert_eq!(model.detokenize(&[MOCK_EOS], true).unwrap(), "</s>");

    assert_eq!(model.token_string(MOCK_EOS).unwrap().as_deref(), Some("</s>"));
    assert!(model.token_attributes(MOCK_EOS).unwrap().names().contains(&"control"));
    assert_eq!(model.train_context_size().unwrap(), 2048);
    assert_eq!(model.embedding_size().unwrap(), 256);
    assert_eq!(model.total_parameters().unwrap(), 1_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_text_grows_buffers() {
    init_logging();
    let piece = "long ".repeat(60);
    let description = format!("mock {} Q8_0", "7B ".repeat(80));
    let (_engine, model) = loaded(
        MockEngine::builder()
            .description(description.clone())
            .word_piece(piece.clone())
            .build(),
    )
    .await;

    assert_eq!(model.description().unwrap(), description);

    let tokens = model.tokenize(&piece, false).unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(model.detokenize_piece(tokens[0]).unwrap(), piece);

    let text = format!("Hello{}{}", piece, piece);
    let tokens = model.tokenize(&text, false).unwrap();
    assert_eq!(tokens.len(), 3);
    assert_eq!(model.detokenize(&tokens, false).unwrap(), text);

    model.dispose().unwrap().await.unwrap();
}

proptest! {
    #[test]
    fn prop_tokenize_detokenize_roundtrip(text in "\\PC{0,48}") {
        let model = shared_model();
        let tokens = model.tokenize(&text, false).unwrap();
        prop_assert_eq!(model.detokenize(&tokens, false).unwrap(), text);
    }
}
