//! Token generation.
//!
//! A [`SamplingSession`] owns one native context and one sampler chain for
//! the duration of a completion and frees both when dropped, so every exit
//! path of the loop releases them.
//!
//! The loop decodes the prompt as one batch, then repeatedly samples a
//! token, feeds it back to the sampler, stops on end-of-generation and
//! decodes the new token. At most `n_ctx - n_prompt` tokens are generated,
//! further capped by [`ContextOptions::max_tokens`].

use crate::engine::{InferenceEngine, NativeContext, NativeSampler, Token, Vocab};
use crate::error::{ModelError, Result};
use crate::grammar::GrammarCompiler;
use crate::model::OwnedLease;
use crate::params::ContextOptions;
use crate::sampling::{SamplerConfig, SamplingParameters};
use crate::task::panic_message;
use futures::Stream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of a synchronous completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tokens_generated: usize,
    /// Sampling configuration actually used
    pub params: SamplingParameters,
}

struct SamplingSession<'a> {
    vocab: Vocab<'a>,
    ctx: NativeContext,
    sampler: NativeSampler,
    config: SamplerConfig,
}

impl<'a> SamplingSession<'a> {
    fn new(
        vocab: Vocab<'a>,
        options: &ContextOptions,
        params: &SamplingParameters,
        compiler: &dyn GrammarCompiler,
    ) -> Result<Self> {
        let context_params = options.to_context_params()?;
        let config = params.resolve(&vocab, compiler)?;
        let engine = vocab.engine();

        let ctx = engine.new_context(vocab.model(), &context_params).ok_or_else(|| {
            ModelError::ContextCreationError(format!(
                "n_ctx={} n_batch={}",
                context_params.n_ctx, context_params.n_batch
            ))
        })?;
        let sampler = match engine.new_sampler(vocab.model(), &config) {
            Ok(sampler) => sampler,
            Err(e) => {
                engine.free_context(ctx);
                return Err(e);
            }
        };

        Ok(Self {
            vocab,
            ctx,
            sampler,
            config,
        })
    }

    fn engine(&self) -> &'a dyn InferenceEngine {
        self.vocab.engine()
    }

    /// Run the loop, handing each piece to `emit`; `emit` returns `false` to stop.
    /// Returns the number of tokens generated.
    fn run(&mut self, prompt: &str, max_tokens: Option<usize>, mut emit: impl FnMut(&[u8]) -> bool) -> Result<usize> {
        let engine = self.engine();
        let prompt_tokens = self.vocab.tokenize(prompt, true, true)?;
        if prompt_tokens.is_empty() {
            return Err(ModelError::TokenizeError("an empty prompt".to_string()));
        }

        let n_prompt = prompt_tokens.len();
        let n_ctx = engine.n_ctx(self.ctx);
        if n_prompt >= n_ctx as usize {
            return Err(ModelError::PromptTooLong { n_prompt, n_ctx });
        }
        let budget = n_ctx as usize - n_prompt;
        let n_predict = max_tokens.map_or(budget, |max| max.min(budget));
        log::debug!("Generating up to {} tokens after a {} token prompt", n_predict, n_prompt);

        let mut batch: Vec<Token> = prompt_tokens;
        let mut generated = 0;
        while generated < n_predict {
            let status = engine.decode(self.ctx, &batch);
            if status != 0 {
                return Err(ModelError::DecodeError(status));
            }

            let token = engine.sample(self.sampler, self.ctx, -1);
            engine.accept(self.sampler, token);
            if self.vocab.is_eog(token) {
                break;
            }

            let piece = self.vocab.token_piece(token, true)?;
            generated += 1;
            if !emit(&piece) {
                log::debug!("Generation stopped by consumer after {} tokens", generated);
                break;
            }
            batch.clear();
            batch.push(token);
        }
        Ok(generated)
    }
}

impl Drop for SamplingSession<'_> {
    fn drop(&mut self) {
        let engine = self.engine();
        engine.free_sampler(self.sampler);
        engine.free_context(self.ctx);
    }
}

pub(crate) fn complete_sync(
    vocab: Vocab<'_>,
    compiler: &dyn GrammarCompiler,
    prompt: &str,
    options: &ContextOptions,
    params: &SamplingParameters,
) -> Result<Completion> {
    let mut session = SamplingSession::new(vocab, options, params, compiler)?;
    let mut content = Vec::new();
    let tokens_generated = session.run(prompt, options.max_tokens, |piece| {
        content.extend_from_slice(piece);
        true
    })?;

    Ok(Completion {
        content: String::from_utf8_lossy(&content).into_owned(),
        tokens_generated,
        params: session.config.to_parameters(&vocab),
    })
}

/// Text produced by a background completion, piece by piece.
///
/// Yields `Ok` text chunks (always whole UTF-8 characters) and at most one
/// trailing `Err`. Dropping the stream cancels generation.
pub struct CompletionStream {
    receiver: mpsc::UnboundedReceiver<Result<String>>,
    cancel: CancellationToken,
}

impl CompletionStream {
    /// Stop generating after the current token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream into one string, failing on the first error
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;

        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for CompletionStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_completion(
    lease: OwnedLease,
    compiler: Arc<dyn GrammarCompiler>,
    prompt: String,
    options: ContextOptions,
    params: SamplingParameters,
) -> Result<CompletionStream> {
    let runtime = Handle::try_current().map_err(|_| ModelError::NoRuntime)?;
    // Unbounded so the worker never blocks while holding the model lease
    let (sender, receiver) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    runtime.spawn_blocking(move || {
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let mut session = SamplingSession::new(lease.vocab(), &options, &params, compiler.as_ref())?;
            let mut decoder = Utf8Accumulator::default();
            session.run(&prompt, options.max_tokens, |piece| {
                if token.is_cancelled() {
                    return false;
                }
                match decoder.push(piece) {
                    Some(text) => sender.send(Ok(text)).is_ok(),
                    None => true,
                }
            })?;
            if let Some(rest) = decoder.finish() {
                let _ = sender.send(Ok(rest));
            }
            Ok(())
        }))
        .unwrap_or_else(|panic| Err(ModelError::TaskFailed(panic_message(panic))));

        if let Err(e) = outcome {
            log::warn!("Streaming completion failed: {}", e);
            let _ = sender.send(Err(e));
        }
        drop(lease);
    });

    Ok(CompletionStream { receiver, cancel })
}

/// Buffers bytes until they form whole UTF-8 characters
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Only an incomplete trailing sequence is held back
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        if complete == 0 {
            return None;
        }
        let rest = self.pending.split_off(complete);
        let ready = std::mem::replace(&mut self.pending, rest);
        Some(String::from_utf8_lossy(&ready).into_owned())
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InferenceEngine, MockEngine, NativeModel};
    use crate::grammar::JsonSchemaCompiler;
    use std::path::Path;

    fn load(engine: &MockEngine) -> NativeModel {
        engine
            .load_model(Path::new("mock.gguf"), &Default::default(), None)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_utf8_accumulator_holds_partial_characters() {
        let mut acc = Utf8Accumulator::default();
        let bytes = "hé!".as_bytes();
        assert_eq!(acc.push(&bytes[..2]).as_deref(), Some("h"));
        assert_eq!(acc.push(&bytes[2..3]).as_deref(), Some("é"));
        assert_eq!(acc.push(&bytes[3..]).as_deref(), Some("!"));
        assert_eq!(acc.finish(), None);

        let mut acc = Utf8Accumulator::default();
        assert_eq!(acc.push(&[0xE2, 0x82]), None);
        assert_eq!(acc.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn test_greedy_completion() {
        let engine = MockEngine::default();
        let model = load(&engine);
        let completion = complete_sync(
            Vocab::new(&engine, model),
            &JsonSchemaCompiler,
            "Hello",
            &ContextOptions::default(),
            &SamplingParameters::greedy(),
        )
        .unwrap();
        assert_eq!(completion.content, " world!");
        assert_eq!(completion.tokens_generated, 2);
        assert_eq!(completion.params.temperature, Some(0.0));
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.live_samplers(), 0);
    }

    #[test]
    fn test_prompt_too_long() {
        let engine = MockEngine::default();
        let model = load(&engine);
        let err = complete_sync(
            Vocab::new(&engine, model),
            &JsonSchemaCompiler,
            "Hello world",
            &ContextOptions::default().with_context_size(2),
            &SamplingParameters::greedy(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::PromptTooLong { n_prompt: 3, n_ctx: 2 }));
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.live_samplers(), 0);
    }

    #[test]
    fn test_context_budget_bounds_generation() {
        let engine = MockEngine::builder().script("").build();
        let model = load(&engine);
        // BOS + "Hello" leaves 6 tokens of an 8 token window
        let completion = complete_sync(
            Vocab::new(&engine, model),
            &JsonSchemaCompiler,
            "Hello",
            &ContextOptions::default().with_context_size(8),
            &SamplingParameters::greedy().with_ignore_eos(true),
        )
        .unwrap();
        assert_eq!(completion.tokens_generated, 6);
    }

    #[test]
    fn test_decode_failure_releases_session() {
        let engine = MockEngine::builder().fail_decode_after(1).build();
        let model = load(&engine);
        let err = complete_sync(
            Vocab::new(&engine, model),
            &JsonSchemaCompiler,
            "Hello",
            &ContextOptions::default(),
            &SamplingParameters::greedy(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::DecodeError(-3)));
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.live_samplers(), 0);
    }
}
