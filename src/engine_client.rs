use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::PDResult;
use crate::io_struct::{
    BeamSearchParams, DecodingConfig, Device, GenerateOptions, LoRARequest, ModelConfig,
    PDResponse, PoolingParams, Prompt, SamplingParams,
};

/// Lazy, finite sequence of responses for one request. An error item is
/// always the last item.
pub type GenerateStream = BoxStream<'static, PDResult<PDResponse>>;

/// Turns caller prompts into token ids ahead of an engine.
pub trait InputPreprocessor: Send + Sync {
    fn preprocess(&self, prompt: &Prompt) -> PDResult<Vec<u32>>;
}

/// Call surface a serving front-end drives.
///
/// Implementations that cannot provide an operation must fail fast with
/// `PDError::NotSupported` instead of hanging.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn generate(
        &self,
        prompt: Prompt,
        sampling_params: SamplingParams,
        request_id: String,
        options: GenerateOptions,
    ) -> PDResult<GenerateStream>;

    async fn beam_search(
        &self,
        prompt: Prompt,
        request_id: String,
        params: BeamSearchParams,
    ) -> PDResult<GenerateStream>;

    /// Pooling/embedding request.
    async fn encode(
        &self,
        prompt: Prompt,
        pooling_params: PoolingParams,
        request_id: String,
        options: GenerateOptions,
    ) -> PDResult<Vec<f32>>;

    async fn abort(&self, request_id: &str) -> PDResult<()>;

    async fn get_model_config(&self) -> PDResult<ModelConfig>;

    async fn get_decoding_config(&self) -> PDResult<DecodingConfig>;

    async fn get_input_preprocessor(&self) -> PDResult<Arc<dyn InputPreprocessor>>;

    /// Identifier of the tokenizer backing the served model.
    async fn get_tokenizer(&self, lora_request: Option<LoRARequest>) -> PDResult<String>;

    async fn is_tracing_enabled(&self) -> bool;

    async fn do_log_stats(&self);

    async fn check_health(&self) -> PDResult<()>;

    async fn start_profile(&self) -> PDResult<()>;

    async fn stop_profile(&self) -> PDResult<()>;

    async fn reset_prefix_cache(&self, device: Option<Device>) -> PDResult<()>;

    async fn sleep(&self, level: u32) -> PDResult<()>;

    async fn wake_up(&self) -> PDResult<()>;

    async fn is_sleeping(&self) -> bool;

    async fn add_lora(&self, lora_request: LoRARequest) -> PDResult<()>;
}
