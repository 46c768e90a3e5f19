use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::PDResult;
use crate::registry::{RequestRegistry, RouteError};
use crate::transport::MessageSource;

/// Pull responses from both tiers and hand each one to the `generate` call
/// that owns its request id.
///
/// Returns `Ok(())` when cancelled. Any transport or decode failure ends the
/// loop with an error; the caller is responsible for failing the requests
/// that are still waiting.
pub async fn run_output_router(
    mut source: Box<dyn MessageSource>,
    registry: Arc<RequestRegistry>,
    cancel: CancellationToken,
) -> PDResult<()> {
    debug!("Output router started");
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Output router cancelled");
                return Ok(());
            }
            message = source.recv() => message?,
        };
        let response = codec::decode_response(&message)?;
        match registry.route(response) {
            Ok(()) => {}
            Err(RouteError::UnknownRequest(response)) => {
                warn!(
                    "Dropping response for unknown request {} (finish_reason={:?})",
                    response.request_id, response.finish_reason
                );
            }
            Err(RouteError::Abandoned(response)) => {
                debug!(
                    "Dropping response for abandoned request {}",
                    response.request_id
                );
            }
        }
    }
}

/// Log the number of in-flight requests every `interval` until cancelled.
pub async fn periodic_logging(
    registry: Arc<RequestRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                info!("Running requests: {}", registry.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PDError;
    use crate::io_struct::PDResponse;
    use crate::transport::{MessageSink, memory_channel};

    fn encoded(request_id: &str, finish_reason: Option<&str>) -> bytes::Bytes {
        codec::encode_response(&PDResponse {
            request_id: request_id.to_string(),
            success: true,
            finish_reason: finish_reason.map(str::to_string),
            text: String::new(),
            token_ids: vec![],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_router_routes_and_survives_unknown_ids() {
        let registry = RequestRegistry::new();
        let (_guard, mut rx) = registry.register("known").unwrap();
        let (sink, source) = memory_channel();
        let cancel = CancellationToken::new();
        let router = tokio::spawn(run_output_router(
            Box::new(source),
            registry.clone(),
            cancel.clone(),
        ));

        sink.send(encoded("unknown", None)).await.unwrap();
        sink.send(encoded("known", Some("stop"))).await.unwrap();
        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.finish_reason.as_deref(), Some("stop"));

        cancel.cancel();
        router.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_router_fails_on_malformed_message() {
        let registry = RequestRegistry::new();
        let (sink, source) = memory_channel();
        let router = tokio::spawn(run_output_router(
            Box::new(source),
            registry,
            CancellationToken::new(),
        ));
        sink.send(bytes::Bytes::from_static(&[0xff, 0xff])).await.unwrap();
        let err = router.await.unwrap().unwrap_err();
        assert!(matches!(err, PDError::Codec(_)));
    }

    #[tokio::test]
    async fn test_router_fails_when_channel_closes() {
        let registry = RequestRegistry::new();
        let (sink, source) = memory_channel();
        drop(sink);
        let err = run_output_router(Box::new(source), registry, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PDError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_periodic_logging_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(periodic_logging(
            RequestRegistry::new(),
            Duration::from_millis(5),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), reporter)
            .await
            .unwrap()
            .unwrap();
    }
}
