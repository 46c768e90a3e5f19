use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TOKENS: u32 = 32000;

/// Sampling parameters forwarded to both tiers.
///
/// Only `max_tokens` is rewritten by the coordinator; everything else is
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub min_tokens: u32,
    pub seed: Option<u64>,
    pub stop: Vec<String>,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            min_tokens: 0,
            seed: None,
            stop: Vec::new(),
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }
}

/// Request sent on the outbound prefill and decode channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PDRequest {
    pub request_id: String,
    pub prompt: String,
    pub sampling_params: SamplingParams,
}

/// Response pulled from the inbound channel, produced by either tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PDResponse {
    pub request_id: String,
    pub success: bool,
    pub finish_reason: Option<String>,
    pub text: String,
    pub token_ids: Vec<u32>,
}

impl PDResponse {
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    TokenIds(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(ids: Vec<u32>) -> Self {
        Prompt::TokenIds(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRARequest {
    pub lora_name: String,
    pub lora_int_id: u32,
    pub lora_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAdapterRequest {
    pub prompt_adapter_name: String,
    pub prompt_adapter_id: u32,
    pub prompt_adapter_local_path: String,
    pub prompt_adapter_num_virtual_tokens: u32,
}

/// Optional per-call extras of a richer serving interface.
///
/// The P/D coordinator only accepts the default value of every field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub lora_request: Option<LoRARequest>,
    pub trace_headers: Option<HashMap<String, String>>,
    pub prompt_adapter_request: Option<PromptAdapterRequest>,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSearchParams {
    pub beam_width: u32,
    pub max_tokens: u32,
    pub ignore_eos: bool,
    pub temperature: f32,
    pub length_penalty: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolingParams {
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Structured-output settings of a serving engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodingConfig {
    pub guided_decoding_backend: String,
}

/// Placeholder model metadata; the coordinator never loads a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub tokenizer: String,
    pub tokenizer_mode: String,
    pub trust_remote_code: bool,
    pub dtype: String,
    pub seed: u64,
}

impl ModelConfig {
    pub fn for_model(model_name: &str) -> Self {
        Self {
            model: model_name.to_string(),
            tokenizer: model_name.to_string(),
            tokenizer_mode: "auto".to_string(),
            trust_remote_code: false,
            dtype: "auto".to_string(),
            seed: 42,
        }
    }
}
