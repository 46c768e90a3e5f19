#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pd_coordinator::codec;
use pd_coordinator::transport::{MemorySink, MemorySource, MessageSink, MessageSource, memory_channel};
use pd_coordinator::{PDConfig, PDCoordinator, PDRequest, PDResponse, Transports};

/// A coordinator wired to in-memory channels, with the tier ends exposed.
pub struct TestHarness {
    pub coordinator: PDCoordinator,
    /// Requests the coordinator sent to the prefill tier.
    pub prefill_rx: MemorySource,
    /// Requests the coordinator sent to the decode tier.
    pub decode_rx: MemorySource,
    /// Where the fake tiers push responses.
    pub connector: MemorySink,
}

pub fn test_config() -> PDConfig {
    PDConfig::new(
        "ipc:///nonexistent/pd_test_prefill",
        "ipc:///nonexistent/pd_test_decode",
        "ipc:///nonexistent/pd_test_connector",
        "facebook/opt-125m",
    )
}

pub fn harness() -> TestHarness {
    harness_with_config(test_config())
}

pub fn harness_with_config(config: PDConfig) -> TestHarness {
    let (to_prefill, prefill_rx) = memory_channel();
    let (to_decode, decode_rx) = memory_channel();
    let (connector, from_tiers) = memory_channel();
    let coordinator = PDCoordinator::with_transports(
        config,
        Transports {
            to_prefill: Arc::new(to_prefill),
            to_decode: Arc::new(to_decode),
            from_tiers: Box::new(from_tiers),
        },
    )
    .expect("valid test config");
    TestHarness {
        coordinator,
        prefill_rx,
        decode_rx,
        connector,
    }
}

impl TestHarness {
    pub async fn next_prefill(&mut self) -> PDRequest {
        next_request(&mut self.prefill_rx).await
    }

    pub async fn next_decode(&mut self) -> PDRequest {
        next_request(&mut self.decode_rx).await
    }

    pub async fn push(&self, response: PDResponse) {
        self.connector
            .send(codec::encode_response(&response).unwrap())
            .await
            .unwrap();
    }
}

pub async fn next_request(source: &mut MemorySource) -> PDRequest {
    let bytes = tokio::time::timeout(Duration::from_secs(5), source.recv())
        .await
        .expect("timed out waiting for a request")
        .expect("channel closed");
    codec::decode_request(&bytes).unwrap()
}

pub fn ok_response(request_id: &str, text: &str, finish_reason: Option<&str>) -> PDResponse {
    PDResponse {
        request_id: request_id.to_string(),
        success: true,
        finish_reason: finish_reason.map(str::to_string),
        text: text.to_string(),
        token_ids: vec![],
    }
}

pub fn failed_response(request_id: &str) -> PDResponse {
    PDResponse {
        request_id: request_id.to_string(),
        success: false,
        finish_reason: None,
        text: String::new(),
        token_ids: vec![],
    }
}
