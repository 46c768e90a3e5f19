//! Prefill/decode request coordinator.
//!
//! Each `generate` call sends the request to the prefill tier with
//! `max_tokens = 1`, waits for the single prefill response, then forwards the
//! request with its original `max_tokens` to the decode tier and streams the
//! decode responses back until one carries a finish reason. Responses from
//! both tiers arrive on one inbound channel and are routed to the owning call
//! by a background router task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::PDConfig;
use crate::engine_client::{EngineClient, GenerateStream, InputPreprocessor};
use crate::error::{PDError, PDResult, Phase};
use crate::io_struct::{
    BeamSearchParams, DecodingConfig, Device, GenerateOptions, LoRARequest, ModelConfig,
    PDRequest, PDResponse, PoolingParams, Prompt, SamplingParams,
};
use crate::registry::{RegistrationGuard, RequestRegistry, ResponseReceiver};
use crate::router::{periodic_logging, run_output_router};
use crate::transport::{
    Endpoint, MessageSink, MessageSource, PullChannel, PushChannel, remove_ipc_path,
};

const TASK_STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    /// The output router died; no request can complete any more.
    Failed(String),
    ShutDown,
}

/// The three channels a coordinator talks over.
pub struct Transports {
    pub to_prefill: Arc<dyn MessageSink>,
    pub to_decode: Arc<dyn MessageSink>,
    pub from_tiers: Box<dyn MessageSource>,
}

impl Transports {
    /// Bind socket channels on the configured endpoints.
    pub async fn bind(config: &PDConfig) -> PDResult<Self> {
        let (prefill, decode, connector) = config.endpoints()?;
        Ok(Self {
            to_prefill: Arc::new(PushChannel::bind(prefill).await?),
            to_decode: Arc::new(PushChannel::bind(decode).await?),
            from_tiers: Box::new(PullChannel::bind(connector, config.inbound_capacity).await?),
        })
    }
}

struct BackgroundTasks {
    cancel: CancellationToken,
    router: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    async fn stop(self) {
        self.cancel.cancel();
        for handle in std::iter::once(self.router).chain(self.reporter) {
            join_stopped(handle).await;
        }
    }
}

/// Wait for a cancelled task, aborting it once the grace period runs out.
/// Returns `false` if the task panicked.
async fn join_stopped(mut handle: JoinHandle<()>) -> bool {
    let joined = match tokio::time::timeout(TASK_STOP_GRACE, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            handle.abort();
            handle.await
        }
    };
    match joined {
        Err(e) if e.is_panic() => {
            error!("Background task panicked during shutdown");
            false
        }
        _ => true,
    }
}

struct Inner {
    config: PDConfig,
    model_config: ModelConfig,
    registry: Arc<RequestRegistry>,
    to_prefill: Arc<dyn MessageSink>,
    to_decode: Arc<dyn MessageSink>,
    from_tiers: Mutex<Option<Box<dyn MessageSource>>>,
    state: Mutex<LifecycleState>,
    tasks: Mutex<Option<BackgroundTasks>>,
    endpoints: Vec<Endpoint>,
}

impl Inner {
    fn enter_failed(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Failed(reason);
        }
        let pending = self.registry.close_all();
        if pending > 0 {
            warn!("Failing {} in-flight requests after router failure", pending);
        }
    }

    fn queue_closed_error(&self, request_id: &str) -> PDError {
        let reason = match &*self.state.lock() {
            LifecycleState::Failed(reason) => format!("coordinator failed: {}", reason),
            LifecycleState::ShutDown => "coordinator shut down".to_string(),
            _ => "response queue closed".to_string(),
        };
        PDError::Aborted {
            request_id: request_id.to_string(),
            reason,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.cancel.cancel();
            tasks.router.abort();
            if let Some(reporter) = tasks.reporter {
                reporter.abort();
            }
        }
    }
}

/// Coordinates requests across one prefill and one decode tier.
///
/// Cheap to clone; all clones share the same registry, channels and
/// background tasks.
#[derive(Clone)]
pub struct PDCoordinator {
    inner: Arc<Inner>,
}

impl PDCoordinator {
    /// Bind the configured socket endpoints and build a coordinator on them.
    pub async fn bind(config: PDConfig) -> PDResult<Self> {
        config.validate()?;
        let transports = match Transports::bind(&config).await {
            Ok(transports) => transports,
            Err(e) => {
                if let Ok((prefill, decode, connector)) = config.endpoints() {
                    remove_endpoint_files(&[prefill, decode, connector]);
                }
                return Err(e);
            }
        };
        Self::with_transports(config, transports)
    }

    /// Build a coordinator over caller-provided channels. Background tasks
    /// are started by [`PDCoordinator::start`] or lazily by the first request.
    pub fn with_transports(config: PDConfig, transports: Transports) -> PDResult<Self> {
        config.validate()?;
        let (prefill, decode, connector) = config.endpoints()?;
        let model_config = ModelConfig::for_model(&config.model_name);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                model_config,
                registry: RequestRegistry::new(),
                to_prefill: transports.to_prefill,
                to_decode: transports.to_decode,
                from_tiers: Mutex::new(Some(transports.from_tiers)),
                state: Mutex::new(LifecycleState::NotStarted),
                tasks: Mutex::new(None),
                endpoints: vec![prefill, decode, connector],
            }),
        })
    }

    /// Start the output router and the liveness reporter. Idempotent; must
    /// be called from within a Tokio runtime.
    pub fn start(&self) -> PDResult<()> {
        let mut state = self.inner.state.lock();
        match &*state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Failed(reason) => {
                return Err(PDError::CoordinatorFailed(reason.clone()));
            }
            LifecycleState::ShutDown => return Err(PDError::ShutDown),
            LifecycleState::NotStarted => {}
        }
        let source = self
            .inner
            .from_tiers
            .lock()
            .take()
            .ok_or(PDError::ChannelClosed)?;

        let cancel = CancellationToken::new();
        let registry = self.inner.registry.clone();
        let router = tokio::spawn(supervise_router(
            source,
            Arc::downgrade(&self.inner),
            registry.clone(),
            cancel.clone(),
        ));
        let reporter = self
            .inner
            .config
            .log_interval()
            .map(|interval| tokio::spawn(periodic_logging(registry, interval, cancel.clone())));

        *self.inner.tasks.lock() = Some(BackgroundTasks {
            cancel,
            router,
            reporter,
        });
        *state = LifecycleState::Running;
        info!(
            "P/D coordinator running: prefill={} decode={} connector={}",
            self.inner.config.prefill_addr,
            self.inner.config.decode_addr,
            self.inner.config.connector_addr
        );
        Ok(())
    }

    /// Stop background tasks, fail in-flight requests, close the channels
    /// and remove socket files. Safe to call repeatedly or before any request.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            if *state == LifecycleState::ShutDown {
                debug!("P/D coordinator already shut down");
                return;
            }
            *state = LifecycleState::ShutDown;
            self.inner.tasks.lock().take()
        };
        if let Some(tasks) = tasks {
            tasks.stop().await;
        }

        let pending = self.inner.registry.close_all();
        if pending > 0 {
            warn!("Shutting down with {} in-flight requests", pending);
        }
        self.inner.to_prefill.close().await;
        self.inner.to_decode.close().await;
        drop(self.inner.from_tiers.lock().take());
        remove_endpoint_files(&self.inner.endpoints);
        info!("P/D coordinator shut down");
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.lock().clone()
    }

    pub fn num_running_requests(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn config(&self) -> &PDConfig {
        &self.inner.config
    }
}

fn remove_endpoint_files(endpoints: &[Endpoint]) {
    for endpoint in endpoints {
        match remove_ipc_path(endpoint) {
            Ok(true) => debug!("Removed socket file for {}", endpoint),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove socket file for {}: {}", endpoint, e),
        }
    }
}

async fn supervise_router(
    source: Box<dyn MessageSource>,
    inner: Weak<Inner>,
    registry: Arc<RequestRegistry>,
    cancel: CancellationToken,
) {
    if let Err(e) = run_output_router(source, registry.clone(), cancel).await {
        error!("Output router failed: {}", e);
        match inner.upgrade() {
            Some(inner) => inner.enter_failed(e.to_string()),
            None => {
                registry.close_all();
            }
        }
    }
}

fn check_supported(prompt: Prompt, options: &GenerateOptions) -> PDResult<String> {
    let text = match prompt {
        Prompt::Text(text) => text,
        Prompt::TokenIds(_) => {
            return Err(PDError::UnsupportedFeature {
                feature: "non-text prompts",
            });
        }
    };
    if options.lora_request.is_some() {
        return Err(PDError::UnsupportedFeature { feature: "LoRA" });
    }
    if options.trace_headers.is_some() {
        return Err(PDError::UnsupportedFeature { feature: "tracing" });
    }
    if options.prompt_adapter_request.is_some() {
        return Err(PDError::UnsupportedFeature {
            feature: "prompt adapter",
        });
    }
    if options.priority != 0 {
        return Err(PDError::UnsupportedFeature { feature: "priority" });
    }
    Ok(text)
}

/// Per-request protocol state. Owns the registry entry through its guard, so
/// dropping the flow on any path unregisters the request.
struct RequestFlow {
    inner: Arc<Inner>,
    request: PDRequest,
    original_max_tokens: u32,
    queue: ResponseReceiver,
    _registration: RegistrationGuard,
}

enum FlowState {
    Pending(RequestFlow),
    Decoding(RequestFlow),
    Done,
}

impl RequestFlow {
    fn into_stream(self) -> GenerateStream {
        stream::unfold(FlowState::Pending(self), |state| async move {
            match state {
                FlowState::Pending(mut flow) => match flow.prefill().await {
                    Ok(response) => Some((Ok(response), FlowState::Decoding(flow))),
                    Err(e) => Some((Err(flow.fail(e)), FlowState::Done)),
                },
                FlowState::Decoding(mut flow) => match flow.next_decode().await {
                    Ok(response) if response.is_finished() => {
                        debug!(
                            "Request {} finished: {:?}",
                            flow.request.request_id, response.finish_reason
                        );
                        Some((Ok(response), FlowState::Done))
                    }
                    Ok(response) => Some((Ok(response), FlowState::Decoding(flow))),
                    Err(e) => Some((Err(flow.fail(e)), FlowState::Done)),
                },
                FlowState::Done => None,
            }
        })
        .boxed()
    }

    async fn prefill(&mut self) -> PDResult<PDResponse> {
        self.request.sampling_params.max_tokens = 1;
        self.inner
            .to_prefill
            .send(codec::encode_request(&self.request)?)
            .await?;
        debug!("Sent request {} to prefill", self.request.request_id);

        let response = self.next_response(Phase::Prefill).await?;
        if !response.success {
            return Err(PDError::PrefillFailed(self.request.request_id.clone()));
        }

        self.request.sampling_params.max_tokens = self.original_max_tokens;
        self.inner
            .to_decode
            .send(codec::encode_request(&self.request)?)
            .await?;
        debug!("Sent request {} to decode", self.request.request_id);
        Ok(response)
    }

    async fn next_decode(&mut self) -> PDResult<PDResponse> {
        let response = self.next_response(Phase::Decode).await?;
        if !response.success {
            return Err(PDError::DecodeFailed(self.request.request_id.clone()));
        }
        Ok(response)
    }

    async fn next_response(&mut self, phase: Phase) -> PDResult<PDResponse> {
        let received = match self.inner.config.request_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.queue.recv())
                .await
                .map_err(|_| PDError::Timeout {
                    request_id: self.request.request_id.clone(),
                    phase,
                    timeout,
                })?,
            None => self.queue.recv().await,
        };
        let Some(response) = received else {
            return Err(self.inner.queue_closed_error(&self.request.request_id));
        };
        if response.request_id != self.request.request_id {
            error!(
                "Response for {} delivered to request {} during {}",
                response.request_id, self.request.request_id, phase
            );
            return Err(PDError::RequestIdMismatch {
                expected: self.request.request_id.clone(),
                got: response.request_id,
            });
        }
        Ok(response)
    }

    fn fail(&self, e: PDError) -> PDError {
        warn!("Request {} failed: {}", self.request.request_id, e);
        e
    }
}

fn not_supported<T>(operation: &'static str) -> PDResult<T> {
    Err(PDError::NotSupported { operation })
}

#[async_trait]
impl EngineClient for PDCoordinator {
    async fn generate(
        &self,
        prompt: Prompt,
        sampling_params: SamplingParams,
        request_id: String,
        options: GenerateOptions,
    ) -> PDResult<GenerateStream> {
        let prompt = check_supported(prompt, &options)?;
        self.start()?;
        let (registration, queue) = self.inner.registry.register(&request_id)?;
        debug!("Registered request {}", request_id);

        let flow = RequestFlow {
            inner: self.inner.clone(),
            original_max_tokens: sampling_params.max_tokens,
            request: PDRequest {
                request_id,
                prompt,
                sampling_params,
            },
            queue,
            _registration: registration,
        };
        Ok(flow.into_stream())
    }

    async fn beam_search(
        &self,
        _prompt: Prompt,
        _request_id: String,
        _params: BeamSearchParams,
    ) -> PDResult<GenerateStream> {
        not_supported("beam_search")
    }

    async fn encode(
        &self,
        _prompt: Prompt,
        _pooling_params: PoolingParams,
        _request_id: String,
        _options: GenerateOptions,
    ) -> PDResult<Vec<f32>> {
        not_supported("encode")
    }

    async fn abort(&self, _request_id: &str) -> PDResult<()> {
        not_supported("abort")
    }

    async fn get_model_config(&self) -> PDResult<ModelConfig> {
        Ok(self.inner.model_config.clone())
    }

    async fn get_decoding_config(&self) -> PDResult<DecodingConfig> {
        not_supported("get_decoding_config")
    }

    async fn get_input_preprocessor(&self) -> PDResult<Arc<dyn InputPreprocessor>> {
        not_supported("get_input_preprocessor")
    }

    async fn get_tokenizer(&self, lora_request: Option<LoRARequest>) -> PDResult<String> {
        if lora_request.is_some() {
            return not_supported("LoRA tokenizer");
        }
        Ok(self.inner.model_config.tokenizer.clone())
    }

    async fn is_tracing_enabled(&self) -> bool {
        false
    }

    async fn do_log_stats(&self) {}

    async fn check_health(&self) -> PDResult<()> {
        Ok(())
    }

    async fn start_profile(&self) -> PDResult<()> {
        not_supported("start_profile")
    }

    async fn stop_profile(&self) -> PDResult<()> {
        not_supported("stop_profile")
    }

    async fn reset_prefix_cache(&self, _device: Option<Device>) -> PDResult<()> {
        not_supported("reset_prefix_cache")
    }

    async fn sleep(&self, _level: u32) -> PDResult<()> {
        not_supported("sleep")
    }

    async fn wake_up(&self) -> PDResult<()> {
        not_supported("wake_up")
    }

    async fn is_sleeping(&self) -> bool {
        false
    }

    async fn add_lora(&self, _lora_request: LoRARequest) -> PDResult<()> {
        not_supported("add_lora")
    }
}
