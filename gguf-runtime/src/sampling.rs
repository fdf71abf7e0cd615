//! Sampling parameters and their resolution into an engine sampler config.
//!
//! [`SamplingParameters`] is the caller-facing bundle where every knob is
//! optional. [`SamplingParameters::resolve`] fills the gaps with the native
//! library's common defaults, tokenizes logit-bias keys, expands `ignore_eos`
//! into negative biases and compiles JSON schemas into grammar source,
//! producing a [`SamplerConfig`] the engine can build a sampler chain from.

use crate::engine::{Token, Vocab};
use crate::error::{ModelError, Result};
use crate::grammar::GrammarCompiler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seed value that asks the engine for a random seed
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Sequence breakers used by DRY unless the caller replaces them
pub fn default_dry_sequence_breakers() -> Vec<String> {
    vec!["\n".to_string(), ":".to_string(), "\"".to_string(), "*".to_string()]
}

/// One logit-bias entry keyed by token text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitBiasEntry {
    pub token: String,
    pub bias: f32,
}

/// Logit bias as either a list of entries or a `{text: bias}` map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogitBias {
    List(Vec<LogitBiasEntry>),
    Map(BTreeMap<String, f32>),
}

impl LogitBias {
    pub fn entries(&self) -> Vec<LogitBiasEntry> {
        match self {
            LogitBias::List(list) => list.clone(),
            LogitBias::Map(map) => map
                .iter()
                .map(|(token, bias)| LogitBiasEntry {
                    token: token.clone(),
                    bias: *bias,
                })
                .collect(),
        }
    }
}

/// Caller-facing sampling options; unset fields take engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(alias = "ignoreEOS", alias = "ignoreEos", skip_serializing_if = "Option::is_none")]
    pub ignore_eos: Option<bool>,
    #[serde(alias = "topK", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(alias = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(alias = "minP", skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(alias = "topNSigma", skip_serializing_if = "Option::is_none")]
    pub top_n_sigma: Option<f32>,
    #[serde(alias = "xtcProbability", skip_serializing_if = "Option::is_none")]
    pub xtc_probability: Option<f32>,
    #[serde(alias = "xtcThreshold", skip_serializing_if = "Option::is_none")]
    pub xtc_threshold: Option<f32>,
    #[serde(alias = "typicalP", skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    #[serde(alias = "repeatLastN", skip_serializing_if = "Option::is_none")]
    pub repeat_last_n: Option<i32>,
    #[serde(alias = "repeatPenalty", skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(alias = "presencePenalty", skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(alias = "frequencyPenalty", skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(alias = "dryMultiplier", skip_serializing_if = "Option::is_none")]
    pub dry_multiplier: Option<f32>,
    #[serde(alias = "dryBase", skip_serializing_if = "Option::is_none")]
    pub dry_base: Option<f32>,
    #[serde(alias = "dryAllowedLength", skip_serializing_if = "Option::is_none")]
    pub dry_allowed_length: Option<i32>,
    #[serde(alias = "dryPenaltyLastN", skip_serializing_if = "Option::is_none")]
    pub dry_penalty_last_n: Option<i32>,
    /// Replaces the default breakers; empty strings are dropped
    #[serde(
        alias = "drySequenceBreaker",
        alias = "drySequenceBreakers",
        skip_serializing_if = "Option::is_none"
    )]
    pub dry_sequence_breakers: Option<Vec<String>>,
    #[serde(alias = "dynaTemperatureRange", skip_serializing_if = "Option::is_none")]
    pub dyna_temperature_range: Option<f32>,
    #[serde(alias = "dynaTemperatureExponent", skip_serializing_if = "Option::is_none")]
    pub dyna_temperature_exponent: Option<f32>,
    /// 0 = off, 1 = mirostat, 2 = mirostat v2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirostat: Option<i32>,
    #[serde(alias = "mirostatLearningRate", skip_serializing_if = "Option::is_none")]
    pub mirostat_learning_rate: Option<f32>,
    #[serde(alias = "mirostatTau", skip_serializing_if = "Option::is_none")]
    pub mirostat_tau: Option<f32>,
    #[serde(alias = "logitBias", skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<LogitBias>,
    /// Grammar source in GBNF
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// JSON schema text; when present it takes precedence over `grammar`
    #[serde(alias = "jsonSchema", skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
}

impl SamplingParameters {
    pub fn greedy() -> Self {
        Self {
            temperature: Some(0.0),
            top_k: Some(1),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    pub fn with_ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.ignore_eos = Some(ignore_eos);
        self
    }

    /// Resolve into an engine config against a loaded vocabulary
    pub fn resolve(&self, vocab: &Vocab<'_>, compiler: &dyn GrammarCompiler) -> Result<SamplerConfig> {
        let mut config = SamplerConfig::default();

        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(temp) = self.temperature {
            config.temperature = temp;
        }

        // Only meaningful when the vocabulary has an EOS token at all
        if self.ignore_eos.unwrap_or(false) && vocab.has_eos() {
            config.ignore_eos = true;
            for token in vocab.eog_tokens() {
                config.logit_bias.push((token, f32::NEG_INFINITY));
            }
        }

        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        if let Some(v) = self.top_p {
            config.top_p = v;
        }
        if let Some(v) = self.min_p {
            config.min_p = v;
        }
        if let Some(v) = self.top_n_sigma {
            config.top_n_sigma = v;
        }
        if let Some(v) = self.xtc_probability {
            config.xtc_probability = v;
        }
        if let Some(v) = self.xtc_threshold {
            config.xtc_threshold = v;
        }
        if let Some(v) = self.typical_p {
            config.typical_p = v;
        }
        if let Some(v) = self.repeat_last_n {
            let v = v.max(-1);
            config.penalty_last_n = v;
            config.n_prev = config.n_prev.max(v);
        }
        if let Some(v) = self.repeat_penalty {
            config.penalty_repeat = v;
        }
        if let Some(v) = self.presence_penalty {
            config.penalty_present = v;
        }
        if let Some(v) = self.frequency_penalty {
            config.penalty_freq = v;
        }
        if let Some(v) = self.dry_multiplier {
            config.dry_multiplier = v;
        }
        if let Some(v) = self.dry_base {
            config.dry_base = v;
        }
        if let Some(v) = self.dry_allowed_length {
            config.dry_allowed_length = v;
        }
        if let Some(v) = self.dry_penalty_last_n {
            config.dry_penalty_last_n = v.max(-1);
        }
        if let Some(breakers) = &self.dry_sequence_breakers {
            config.dry_sequence_breakers = breakers.iter().filter(|b| !b.is_empty()).cloned().collect();
        }
        if let Some(v) = self.dyna_temperature_range {
            config.dynatemp_range = v;
        }
        if let Some(v) = self.dyna_temperature_exponent {
            config.dynatemp_exponent = v;
        }
        if let Some(v) = self.mirostat {
            if !(0..=2).contains(&v) {
                return Err(ModelError::InvalidParameter(format!("mirostat must be 0, 1 or 2, got {}", v)));
            }
            config.mirostat = v;
        }
        if let Some(v) = self.mirostat_learning_rate {
            config.mirostat_eta = v;
        }
        if let Some(v) = self.mirostat_tau {
            config.mirostat_tau = v;
        }

        if let Some(bias) = &self.logit_bias {
            for entry in bias.entries() {
                // Plain text: no BOS, but special-token text maps to its id
                let tokens = vocab.tokenize(&entry.token, false, true)?;
                for token in tokens {
                    config.logit_bias.push((token, entry.bias));
                }
            }
        }

        if let Some(grammar) = self.grammar.as_deref().filter(|g| !g.is_empty()) {
            config.grammar = Some(grammar.to_string());
        }
        if let Some(schema) = self.json_schema.as_deref().filter(|s| !s.is_empty()) {
            let schema: serde_json::Value = serde_json::from_str(schema)
                .map_err(|e| ModelError::GrammarError(format!("Invalid JSON schema: {}", e)))?;
            config.grammar = Some(compiler.compile(&schema)?);
        }

        Ok(config)
    }
}

/// Fully resolved sampling configuration handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub seed: u32,
    pub temperature: f32,
    pub ignore_eos: bool,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub top_n_sigma: f32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub typical_p: f32,
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    /// Accepted tokens kept for penalties
    pub n_prev: i32,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub min_keep: usize,
    pub logit_bias: Vec<(Token, f32)>,
    /// GBNF source with a `root` rule
    pub grammar: Option<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            temperature: 0.8,
            ignore_eos: false,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            top_n_sigma: -1.0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            n_prev: 64,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: default_dry_sequence_breakers(),
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            min_keep: 0,
            logit_bias: Vec::new(),
            grammar: None,
        }
    }
}

impl SamplerConfig {
    /// Render the config back into caller-facing parameters.
    ///
    /// Logit-bias token ids are rendered as their text pieces.
    pub fn to_parameters(&self, vocab: &Vocab<'_>) -> SamplingParameters {
        let logit_bias = if self.logit_bias.is_empty() {
            None
        } else {
            Some(LogitBias::List(
                self.logit_bias
                    .iter()
                    .map(|(token, bias)| LogitBiasEntry {
                        token: vocab
                            .token_piece(*token, true)
                            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                            .unwrap_or_default(),
                        bias: *bias,
                    })
                    .collect(),
            ))
        };

        SamplingParameters {
            seed: Some(self.seed),
            temperature: Some(self.temperature),
            ignore_eos: Some(self.ignore_eos),
            top_k: Some(self.top_k),
            top_p: Some(self.top_p),
            min_p: Some(self.min_p),
            top_n_sigma: Some(self.top_n_sigma),
            xtc_probability: Some(self.xtc_probability),
            xtc_threshold: Some(self.xtc_threshold),
            typical_p: Some(self.typical_p),
            repeat_last_n: Some(self.penalty_last_n),
            repeat_penalty: Some(self.penalty_repeat),
            presence_penalty: Some(self.penalty_present),
            frequency_penalty: Some(self.penalty_freq),
            dry_multiplier: Some(self.dry_multiplier),
            dry_base: Some(self.dry_base),
            dry_allowed_length: Some(self.dry_allowed_length),
            dry_penalty_last_n: Some(self.dry_penalty_last_n),
            dry_sequence_breakers: Some(self.dry_sequence_breakers.clone()),
            dyna_temperature_range: Some(self.dynatemp_range),
            dyna_temperature_exponent: Some(self.dynatemp_exponent),
            mirostat: Some(self.mirostat),
            mirostat_learning_rate: Some(self.mirostat_eta),
            mirostat_tau: Some(self.mirostat_tau),
            logit_bias,
            grammar: self.grammar.clone(),
            json_schema: None,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0 || self.top_k == 1
    }
}
