//! Deterministic in-process engine.
//!
//! `MockEngine` implements [`InferenceEngine`] without any native library so
//! the lifecycle, progress and generation code can be exercised in tests and
//! during development. The vocabulary has three control tokens, one token per
//! byte and a handful of word pieces. The "model" follows a script: after the
//! prompt it strongly prefers the scripted tokens in order and then EOS.
//!
//! Failures, panics and delays are injected through [`MockEngineBuilder`],
//! and live-object counters let tests check that every context, sampler and
//! adapter was released.

use super::{
    ContextParams, InferenceEngine, NativeAdapter, NativeContext, NativeModel, NativeModelParams,
    NativeSampler, ProgressCheckpoint, Token, TokenAttributes, VocabularyType, TOKEN_NULL,
};
use crate::error::{ModelError, Result};
use crate::sampling::{SamplerConfig, DEFAULT_SEED};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const MOCK_BOS: Token = 0;
pub const MOCK_EOS: Token = 1;
pub const MOCK_EOT: Token = 2;
const BYTE_BASE: Token = 3;
const WORD_BASE: Token = BYTE_BASE + 256;

const SPECIALS: [&str; 3] = ["<s>", "</s>", "<eot>"];

const WORD_PIECES: [&str; 14] = [
    "Hello", " world", " there", "yes", "no", " yes", " no", "!", " the", " model", " is",
    " ready", ".", "\n\n",
];

const MOCK_N_CTX_TRAIN: i32 = 2048;
const MOCK_N_EMBD: i32 = 256;
const MOCK_N_PARAMS: u64 = 1_000_000;
const MOCK_DESC: &str = "mock 1M Q8_0";

#[derive(Debug, Clone, Copy, PartialEq)]
enum PieceKind {
    Control,
    Byte,
    Word,
}

#[derive(Debug, Clone)]
pub struct MockEngineBuilder {
    load_steps: u32,
    step_delay: Duration,
    model_size: u64,
    fail_load: bool,
    panic_on_load: bool,
    adapter_delay: Duration,
    fail_adapter_init: bool,
    fail_context: bool,
    fail_decode_after: Option<usize>,
    decode_delay: Duration,
    script: String,
    description: String,
    extra_words: Vec<String>,
}

impl Default for MockEngineBuilder {
    fn default() -> Self {
        Self {
            load_steps: 100,
            step_delay: Duration::ZERO,
            model_size: 64 * 1024 * 1024,
            fail_load: false,
            panic_on_load: false,
            adapter_delay: Duration::ZERO,
            fail_adapter_init: false,
            fail_context: false,
            fail_decode_after: None,
            decode_delay: Duration::ZERO,
            script: " world!".to_string(),
            description: MOCK_DESC.to_string(),
            extra_words: Vec::new(),
        }
    }
}

impl MockEngineBuilder {
    /// Number of progress callbacks issued while loading
    pub fn load_steps(mut self, steps: u32) -> Self {
        self.load_steps = steps.max(1);
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn model_size(mut self, bytes: u64) -> Self {
        self.model_size = bytes;
        self
    }

    /// Make the loader return no model halfway through
    pub fn fail_load(mut self, fail: bool) -> Self {
        self.fail_load = fail;
        self
    }

    pub fn panic_on_load(mut self, panic: bool) -> Self {
        self.panic_on_load = panic;
        self
    }

    pub fn adapter_delay(mut self, delay: Duration) -> Self {
        self.adapter_delay = delay;
        self
    }

    pub fn fail_adapter_init(mut self, fail: bool) -> Self {
        self.fail_adapter_init = fail;
        self
    }

    pub fn fail_context(mut self, fail: bool) -> Self {
        self.fail_context = fail;
        self
    }

    /// Fail every decode after `n` successful ones on the same context
    pub fn fail_decode_after(mut self, n: usize) -> Self {
        self.fail_decode_after = Some(n);
        self
    }

    pub fn decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    /// Text the model produces after any prompt (empty = EOS right away)
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Text reported by `model_desc`
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a word piece to the vocabulary after the built-in ones
    pub fn word_piece(mut self, piece: impl Into<String>) -> Self {
        self.extra_words.push(piece.into());
        self
    }

    pub fn build(self) -> MockEngine {
        let mut pieces: Vec<(Vec<u8>, PieceKind)> = Vec::new();
        for special in SPECIALS {
            pieces.push((special.as_bytes().to_vec(), PieceKind::Control));
        }
        for byte in 0..=255u8 {
            pieces.push((vec![byte], PieceKind::Byte));
        }
        let words: Vec<Vec<u8>> = WORD_PIECES
            .iter()
            .map(|w| w.as_bytes().to_vec())
            .chain(self.extra_words.iter().map(|w| w.as_bytes().to_vec()))
            .collect();
        for word in &words {
            pieces.push((word.clone(), PieceKind::Word));
        }

        let mut engine = MockEngine {
            pieces,
            words,
            script: Vec::new(),
            options: self,
            state: Mutex::new(MockState::default()),
            next_handle: AtomicUsize::new(1),
            live_models: AtomicUsize::new(0),
            live_contexts: AtomicUsize::new(0),
            live_samplers: AtomicUsize::new(0),
            live_adapters: AtomicUsize::new(0),
        };
        engine.script = engine.encode(engine.options.script.as_bytes(), false, false);
        engine
    }
}

#[derive(Default)]
struct MockState {
    models: HashMap<usize, u64>,
    contexts: HashMap<usize, MockContext>,
    samplers: HashMap<usize, MockSampler>,
    adapters: HashMap<usize, NativeModel>,
}

struct MockContext {
    n_ctx: u32,
    tokens: Vec<Token>,
    decodes: usize,
}

struct MockSampler {
    config: SamplerConfig,
    rng: StdRng,
    grammar: Option<LiteralGrammar>,
    history: Vec<Token>,
}

/// Grammar of the form `root ::= "a" | "b"`
#[derive(Debug, Clone)]
struct LiteralGrammar {
    alternatives: Vec<Vec<u8>>,
    produced: Vec<u8>,
}

impl LiteralGrammar {
    fn parse(source: &str) -> Result<Self> {
        let rhs = source
            .lines()
            .find_map(|line| {
                let (lhs, rhs) = line.split_once("::=")?;
                (lhs.trim() == "root").then_some(rhs)
            })
            .ok_or_else(|| ModelError::GrammarError("Missing root rule".to_string()))?;

        let unsupported = || ModelError::GrammarError(format!("Unsupported grammar: {}", rhs.trim()));
        let mut alternatives = Vec::new();
        let mut chars = rhs.trim().chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.next() != Some('"') {
                return Err(unsupported());
            }
            let mut literal = String::new();
            loop {
                match chars.next().ok_or_else(unsupported)? {
                    '"' => break,
                    '\\' => match chars.next().ok_or_else(unsupported)? {
                        'n' => literal.push('\n'),
                        't' => literal.push('\t'),
                        'r' => literal.push('\r'),
                        other => literal.push(other),
                    },
                    c => literal.push(c),
                }
            }
            alternatives.push(literal.into_bytes());
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                None => break,
                Some('|') => continue,
                Some(_) => return Err(unsupported()),
            }
        }

        Ok(Self {
            alternatives,
            produced: Vec::new(),
        })
    }

    fn is_complete(&self) -> bool {
        self.alternatives.iter().any(|alt| *alt == self.produced)
    }

    fn allows(&self, piece: &[u8]) -> bool {
        if piece.is_empty() {
            return false;
        }
        let mut candidate = self.produced.clone();
        candidate.extend_from_slice(piece);
        self.alternatives.iter().any(|alt| alt.starts_with(&candidate))
    }
}

pub struct MockEngine {
    pieces: Vec<(Vec<u8>, PieceKind)>,
    words: Vec<Vec<u8>>,
    script: Vec<Token>,
    options: MockEngineBuilder,
    state: Mutex<MockState>,
    next_handle: AtomicUsize,
    live_models: AtomicUsize,
    live_contexts: AtomicUsize,
    live_samplers: AtomicUsize,
    live_adapters: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockEngine {
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    pub fn live_models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    pub fn live_samplers(&self) -> usize {
        self.live_samplers.load(Ordering::SeqCst)
    }

    pub fn live_adapters(&self) -> usize {
        self.live_adapters.load(Ordering::SeqCst)
    }

    fn handle(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn kind(&self, token: Token) -> Option<PieceKind> {
        usize::try_from(token).ok().and_then(|i| self.pieces.get(i)).map(|(_, kind)| *kind)
    }

    fn piece(&self, token: Token, special: bool) -> &[u8] {
        match usize::try_from(token).ok().and_then(|i| self.pieces.get(i)) {
            Some((_, PieceKind::Control)) if !special => &[],
            Some((bytes, _)) => bytes,
            None => &[],
        }
    }

    /// Greedy longest-match tokenizer with byte fallback
    fn encode(&self, text: &[u8], add_special: bool, parse_special: bool) -> Vec<Token> {
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(MOCK_BOS);
        }

        let mut i = 0;
        'outer: while i < text.len() {
            let rest = &text[i..];
            if parse_special {
                for (id, special) in SPECIALS.iter().enumerate() {
                    if rest.starts_with(special.as_bytes()) {
                        tokens.push(id as Token);
                        i += special.len();
                        continue 'outer;
                    }
                }
            }

            let best = self
                .words
                .iter()
                .enumerate()
                .filter(|(_, word)| rest.starts_with(word))
                .max_by_key(|(_, word)| word.len());
            match best {
                Some((id, word)) => {
                    tokens.push(WORD_BASE + id as Token);
                    i += word.len();
                }
                None => {
                    tokens.push(BYTE_BASE + rest[0] as Token);
                    i += 1;
                }
            }
        }
        tokens
    }

    fn logits(&self, ctx: &MockContext) -> Vec<f32> {
        let scripted = ctx
            .decodes
            .checked_sub(1)
            .and_then(|pos| self.script.get(pos))
            .copied();
        let last = ctx.tokens.last().copied().unwrap_or(TOKEN_NULL);

        (0..self.pieces.len() as Token)
            .map(|token| {
                if Some(token) == scripted {
                    return 10.0;
                }
                match self.kind(token) {
                    Some(PieceKind::Control) => match token {
                        MOCK_EOS if scripted.is_none() => 12.0,
                        MOCK_EOS => -5.0,
                        _ => -10.0,
                    },
                    Some(PieceKind::Word) => 1.0 + noise(last, token),
                    _ => noise(last, token),
                }
            })
            .collect()
    }
}

/// Deterministic pseudo-random value in `[0, 0.5)`
fn noise(prev: Token, token: Token) -> f32 {
    let mut x = (prev as u32 as u64) << 32 | token as u32 as u64;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    (x % 1000) as f32 / 2000.0
}

/// Copy `src` into `out` following the size-probe convention
fn fill<T: Copy>(src: &[T], out: &mut [T]) -> i32 {
    if out.len() < src.len() {
        return -(src.len() as i32);
    }
    out[..src.len()].copy_from_slice(src);
    src.len() as i32
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn load_model(
        &self,
        path: &Path,
        _params: &NativeModelParams,
        mut progress: Option<ProgressCheckpoint<'_>>,
    ) -> Result<Option<NativeModel>> {
        if self.options.panic_on_load {
            panic!("mock engine: injected panic while loading {}", path.display());
        }

        let steps = self.options.load_steps;
        for step in 1..=steps {
            if !self.options.step_delay.is_zero() {
                std::thread::sleep(self.options.step_delay);
            }
            if let Some(checkpoint) = progress.as_deref_mut() {
                if !checkpoint(step as f32 / steps as f32) {
                    log::debug!("mock load of {} aborted at step {}", path.display(), step);
                    return Ok(None);
                }
            }
            if self.options.fail_load && step * 2 >= steps {
                return Ok(None);
            }
        }

        let handle = self.handle();
        self.state.lock().models.insert(handle, self.options.model_size);
        self.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Some(NativeModel(handle)))
    }

    fn free_model(&self, model: NativeModel) {
        if self.state.lock().models.remove(&model.0).is_some() {
            self.live_models.fetch_sub(1, Ordering::SeqCst);
        } else {
            log::warn!("mock engine: free of unknown model {:?}", model);
        }
    }

    fn model_size(&self, model: NativeModel) -> u64 {
        self.state.lock().models.get(&model.0).copied().unwrap_or(0)
    }

    fn model_n_params(&self, _model: NativeModel) -> u64 {
        MOCK_N_PARAMS
    }

    fn n_ctx_train(&self, _model: NativeModel) -> i32 {
        MOCK_N_CTX_TRAIN
    }

    fn n_embd(&self, _model: NativeModel) -> i32 {
        MOCK_N_EMBD
    }

    fn model_desc(&self, _model: NativeModel, out: &mut [u8]) -> i32 {
        let desc = self.options.description.as_bytes();
        if out.len() > desc.len() {
            out[..desc.len()].copy_from_slice(desc);
            out[desc.len()] = 0;
        }
        desc.len() as i32
    }

    fn n_vocab(&self, _model: NativeModel) -> i32 {
        self.pieces.len() as i32
    }

    fn token_bos(&self, _model: NativeModel) -> Token {
        MOCK_BOS
    }

    fn token_eos(&self, _model: NativeModel) -> Token {
        MOCK_EOS
    }

    fn token_eot(&self, _model: NativeModel) -> Token {
        MOCK_EOT
    }

    fn token_sep(&self, _model: NativeModel) -> Token {
        TOKEN_NULL
    }

    fn token_nl(&self, _model: NativeModel) -> Token {
        BYTE_BASE + b'\n' as Token
    }

    fn token_fim_pre(&self, _model: NativeModel) -> Token {
        TOKEN_NULL
    }

    fn token_fim_mid(&self, _model: NativeModel) -> Token {
        TOKEN_NULL
    }

    fn token_fim_suf(&self, _model: NativeModel) -> Token {
        TOKEN_NULL
    }

    fn token_attr(&self, _model: NativeModel, token: Token) -> TokenAttributes {
        match self.kind(token) {
            Some(PieceKind::Control) => TokenAttributes(TokenAttributes::CONTROL),
            Some(PieceKind::Byte) => TokenAttributes(TokenAttributes::BYTE),
            Some(PieceKind::Word) => TokenAttributes(TokenAttributes::NORMAL),
            None => TokenAttributes(TokenAttributes::UNDEFINED),
        }
    }

    fn token_is_eog(&self, _model: NativeModel, token: Token) -> bool {
        token == MOCK_EOS || token == MOCK_EOT
    }

    fn token_text(&self, _model: NativeModel, token: Token) -> Option<String> {
        self.kind(token)?;
        Some(String::from_utf8_lossy(self.piece(token, true)).into_owned())
    }

    fn vocab_type(&self, _model: NativeModel) -> VocabularyType {
        VocabularyType::Bpe
    }

    fn add_bos(&self, _model: NativeModel) -> bool {
        true
    }

    fn add_eos(&self, _model: NativeModel) -> bool {
        false
    }

    fn tokenize(
        &self,
        _model: NativeModel,
        text: &[u8],
        out: &mut [Token],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        fill(&self.encode(text, add_special, parse_special), out)
    }

    fn detokenize(
        &self,
        _model: NativeModel,
        tokens: &[Token],
        out: &mut [u8],
        remove_special: bool,
        unparse_special: bool,
    ) -> i32 {
        let tokens = match tokens.split_first() {
            Some((&MOCK_BOS, rest)) if remove_special => rest,
            _ => tokens,
        };
        let bytes: Vec<u8> = tokens
            .iter()
            .flat_map(|t| self.piece(*t, unparse_special).iter().copied())
            .collect();
        fill(&bytes, out)
    }

    fn token_to_piece(
        &self,
        _model: NativeModel,
        token: Token,
        out: &mut [u8],
        lstrip: i32,
        special: bool,
    ) -> i32 {
        let mut piece = self.piece(token, special);
        let mut strip = lstrip.max(0);
        while strip > 0 && piece.first() == Some(&b' ') {
            piece = &piece[1..];
            strip -= 1;
        }
        fill(piece, out)
    }

    fn new_context(&self, _model: NativeModel, params: &ContextParams) -> Option<NativeContext> {
        if self.options.fail_context {
            return None;
        }
        let n_ctx = if params.n_ctx == 0 {
            MOCK_N_CTX_TRAIN as u32
        } else {
            params.n_ctx
        };
        let handle = self.handle();
        self.state.lock().contexts.insert(
            handle,
            MockContext {
                n_ctx,
                tokens: Vec::new(),
                decodes: 0,
            },
        );
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        Some(NativeContext(handle))
    }

    fn free_context(&self, ctx: NativeContext) {
        if self.state.lock().contexts.remove(&ctx.0).is_some() {
            self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn n_ctx(&self, ctx: NativeContext) -> u32 {
        self.state.lock().contexts.get(&ctx.0).map(|c| c.n_ctx).unwrap_or(0)
    }

    fn decode(&self, ctx: NativeContext, tokens: &[Token]) -> i32 {
        if !self.options.decode_delay.is_zero() {
            std::thread::sleep(self.options.decode_delay);
        }
        let mut state = self.state.lock();
        let Some(context) = state.contexts.get_mut(&ctx.0) else {
            return -1;
        };
        if tokens.is_empty() {
            return -1;
        }
        if self.options.fail_decode_after.is_some_and(|n| context.decodes >= n) {
            return -3;
        }
        if context.tokens.len() + tokens.len() > context.n_ctx as usize {
            return 1;
        }
        context.tokens.extend_from_slice(tokens);
        context.decodes += 1;
        0
    }

    fn new_sampler(&self, _model: NativeModel, config: &SamplerConfig) -> Result<NativeSampler> {
        let grammar = config.grammar.as_deref().map(LiteralGrammar::parse).transpose()?;
        let seed = if config.seed == DEFAULT_SEED {
            rand::random::<u64>()
        } else {
            config.seed as u64
        };
        let handle = self.handle();
        self.state.lock().samplers.insert(
            handle,
            MockSampler {
                config: config.clone(),
                rng: StdRng::seed_from_u64(seed),
                grammar,
                history: Vec::new(),
            },
        );
        self.live_samplers.fetch_add(1, Ordering::SeqCst);
        Ok(NativeSampler(handle))
    }

    fn sample(&self, sampler: NativeSampler, ctx: NativeContext, _idx: i32) -> Token {
        let mut state = self.state.lock();
        let mut logits = match state.contexts.get(&ctx.0) {
            Some(context) => self.logits(context),
            None => return TOKEN_NULL,
        };
        let Some(smpl) = state.samplers.get_mut(&sampler.0) else {
            return TOKEN_NULL;
        };

        let config = &smpl.config;
        if config.penalty_repeat != 1.0 && config.penalty_last_n != 0 {
            let window = if config.penalty_last_n < 0 {
                smpl.history.len()
            } else {
                (config.penalty_last_n as usize).min(smpl.history.len())
            };
            for token in &smpl.history[smpl.history.len() - window..] {
                let Some(logit) = usize::try_from(*token).ok().and_then(|i| logits.get_mut(i)) else {
                    continue;
                };
                *logit = if *logit > 0.0 {
                    *logit / config.penalty_repeat
                } else {
                    *logit * config.penalty_repeat
                };
            }
        }
        for (token, bias) in &config.logit_bias {
            if let Some(logit) = logits.get_mut(*token as usize) {
                *logit += bias;
            }
        }
        if let Some(grammar) = &smpl.grammar {
            for (token, logit) in logits.iter_mut().enumerate() {
                let token = token as Token;
                let allowed = if token == MOCK_EOS || token == MOCK_EOT {
                    grammar.is_complete()
                } else {
                    self.kind(token) != Some(PieceKind::Control) && grammar.allows(self.piece(token, false))
                };
                if !allowed {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        let mut candidates: Vec<(Token, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(t, l)| (t as Token, *l))
            .collect();
        if candidates.is_empty() {
            return MOCK_EOS;
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if config.is_greedy() {
            return candidates[0].0;
        }
        if config.top_k > 0 {
            candidates.truncate(config.top_k as usize);
        }
        let max = candidates[0].1;
        let weights: Vec<f32> = candidates
            .iter()
            .map(|(_, l)| ((l - max) / config.temperature).exp())
            .collect();
        let total: f32 = weights.iter().sum();
        let mut pick = smpl.rng.random::<f32>() * total;
        for ((token, _), weight) in candidates.iter().zip(&weights) {
            if pick < *weight {
                return *token;
            }
            pick -= weight;
        }
        candidates[candidates.len() - 1].0
    }

    fn accept(&self, sampler: NativeSampler, token: Token) {
        let mut state = self.state.lock();
        if let Some(smpl) = state.samplers.get_mut(&sampler.0) {
            smpl.history.push(token);
            if let Some(grammar) = smpl.grammar.as_mut() {
                if token != MOCK_EOS && token != MOCK_EOT {
                    let piece = self.piece(token, false).to_vec();
                    grammar.produced.extend_from_slice(&piece);
                }
            }
        }
    }

    fn free_sampler(&self, sampler: NativeSampler) {
        if self.state.lock().samplers.remove(&sampler.0).is_some() {
            self.live_samplers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn adapter_init(&self, model: NativeModel, path: &Path) -> Option<NativeAdapter> {
        if !self.options.adapter_delay.is_zero() {
            std::thread::sleep(self.options.adapter_delay);
        }
        if self.options.fail_adapter_init {
            log::debug!("mock engine: refusing adapter {}", path.display());
            return None;
        }
        let handle = self.handle();
        self.state.lock().adapters.insert(handle, model);
        self.live_adapters.fetch_add(1, Ordering::SeqCst);
        Some(NativeAdapter(handle))
    }

    fn adapter_free(&self, adapter: NativeAdapter) {
        if self.state.lock().adapters.remove(&adapter.0).is_some() {
            self.live_adapters.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(engine: &MockEngine) -> NativeModel {
        engine
            .load_model(Path::new("mock.gguf"), &NativeModelParams::default(), None)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_size_probe_returns_negated_length() {
        let engine = MockEngine::default();
        let model = model(&engine);
        let n = engine.tokenize(model, b"Hello world", &mut [], true, true);
        assert_eq!(n, -3); // <s> "Hello" " world"

        let mut tokens = vec![0; 3];
        assert_eq!(engine.tokenize(model, b"Hello world", &mut tokens, true, true), 3);
        assert_eq!(tokens[0], MOCK_BOS);
    }

    #[test]
    fn test_byte_fallback_roundtrip() {
        let engine = MockEngine::default();
        let model = model(&engine);
        let text = "héllo ✓";
        let mut tokens = vec![0; 64];
        let n = engine.tokenize(model, text.as_bytes(), &mut tokens, false, false);
        tokens.truncate(n as usize);

        let mut out = vec![0u8; 64];
        let n = engine.detokenize(model, &tokens, &mut out, false, false);
        assert_eq!(&out[..n as usize], text.as_bytes());
    }

    #[test]
    fn test_literal_grammar_parse() {
        let grammar = LiteralGrammar::parse("root ::= \"yes\" | \"no\"\n").unwrap();
        assert_eq!(grammar.alternatives, vec![b"yes".to_vec(), b"no".to_vec()]);
        assert!(grammar.allows(b"ye"));
        assert!(!grammar.allows(b"x"));
        assert!(LiteralGrammar::parse("root ::= value").is_err());
    }

    #[test]
    fn test_repeat_penalty_skips_invalid_history() {
        let engine = MockEngine::default();
        let model = model(&engine);
        let ctx = engine
            .new_context(model, &crate::params::ContextOptions::default().to_context_params().unwrap())
            .unwrap();
        let config = SamplerConfig {
            temperature: 0.0,
            penalty_repeat: 1.3,
            penalty_last_n: 64,
            ..SamplerConfig::default()
        };
        let sampler = engine.new_sampler(model, &config).unwrap();

        assert_eq!(engine.decode(ctx, &[MOCK_BOS]), 0);
        engine.accept(sampler, TOKEN_NULL);
        engine.accept(sampler, -7);
        let token = engine.sample(sampler, ctx, -1);
        assert!(engine.kind(token).is_some());

        engine.free_sampler(sampler);
        engine.free_context(ctx);
        engine.free_model(model);
    }

    #[test]
    fn test_long_pieces_and_description() {
        let long = "x".repeat(300);
        let engine = MockEngine::builder()
            .description(long.clone())
            .word_piece(long.clone())
            .build();
        let model = model(&engine);

        assert_eq!(engine.tokenize(model, long.as_bytes(), &mut [], false, false), -1);
        let mut small = [0u8; 128];
        assert_eq!(engine.model_desc(model, &mut small), 300);
        assert_eq!(engine.token_to_piece(model, WORD_BASE + WORD_PIECES.len() as Token, &mut small, 0, false), -300);
        engine.free_model(model);
    }

    #[test]
    fn test_counters_track_release() {
        let engine = MockEngine::default();
        let model = model(&engine);
        let ctx = engine.new_context(model, &crate::params::ContextOptions::default().to_context_params().unwrap());
        assert_eq!(engine.live_contexts(), 1);
        engine.free_context(ctx.unwrap());
        engine.free_model(model);
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.live_models(), 0);
    }
}
