use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pd_coordinator::codec;
use pd_coordinator::transport::frame_codec;
use pd_coordinator::{
    EngineClient, GenerateOptions, PDConfig, PDCoordinator, PDError, PDRequest, PDResponse,
    SamplingParams,
};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

type TierReader = FramedRead<UnixStream, LengthDelimitedCodec>;

fn socket_config(dir: &Path) -> PDConfig {
    PDConfig::new(
        &format!("ipc://{}", dir.join("prefill.sock").display()),
        &format!("ipc://{}", dir.join("decode.sock").display()),
        &format!("ipc://{}", dir.join("connector.sock").display()),
        "facebook/opt-125m",
    )
}

async fn connect_reader(path: &Path) -> TierReader {
    FramedRead::new(UnixStream::connect(path).await.unwrap(), frame_codec())
}

async fn read_request(reader: &mut TierReader) -> PDRequest {
    let frame = tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("timed out waiting for a request")
        .expect("tier connection closed")
        .unwrap();
    codec::decode_request(&frame).unwrap()
}

fn response(request_id: &str, text: &str, finish_reason: Option<&str>) -> PDResponse {
    PDResponse {
        request_id: request_id.to_string(),
        success: true,
        finish_reason: finish_reason.map(str::to_string),
        text: text.to_string(),
        token_ids: vec![7],
    }
}

#[tokio::test]
async fn test_request_over_unix_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = PDCoordinator::bind(socket_config(dir.path())).await.unwrap();
    for name in ["prefill.sock", "decode.sock", "connector.sock"] {
        assert!(dir.path().join(name).exists(), "{name} not bound");
    }

    let mut prefill = connect_reader(&dir.path().join("prefill.sock")).await;
    let mut decode = connect_reader(&dir.path().join("decode.sock")).await;
    let mut connector = FramedWrite::new(
        UnixStream::connect(dir.path().join("connector.sock"))
            .await
            .unwrap(),
        frame_codec(),
    );

    let stream = coordinator
        .generate(
            "The capital of France is".into(),
            SamplingParams::with_max_tokens(8),
            "sock-1".into(),
            GenerateOptions::default(),
        )
        .await
        .unwrap();
    let consumer = tokio::spawn(stream.collect::<Vec<_>>());

    let request = read_request(&mut prefill).await;
    assert_eq!(request.request_id, "sock-1");
    assert_eq!(request.sampling_params.max_tokens, 1);
    connector
        .send(codec::encode_response(&response("sock-1", " Paris", None)).unwrap())
        .await
        .unwrap();

    let request = read_request(&mut decode).await;
    assert_eq!(request.sampling_params.max_tokens, 8);
    for (text, finish) in [(",", None), (" of", None), (" course", Some("length"))] {
        connector
            .send(codec::encode_response(&response("sock-1", text, finish)).unwrap())
            .await
            .unwrap();
    }

    let results = consumer.await.unwrap();
    let texts: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().text)
        .collect();
    assert_eq!(texts, vec![" Paris", ",", " of", " course"]);

    coordinator.shutdown().await;
    for name in ["prefill.sock", "decode.sock", "connector.sock"] {
        assert!(!dir.path().join(name).exists(), "{name} left behind");
    }
}

#[tokio::test]
async fn test_bind_failure_leaves_no_socket_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = PDConfig {
        decode_addr: format!(
            "ipc://{}",
            dir.path().join("missing").join("decode.sock").display()
        ),
        ..socket_config(dir.path())
    };

    let err = PDCoordinator::bind(config).await.err().unwrap();
    assert!(matches!(err, PDError::Transport(_)), "{err:?}");
    assert!(!dir.path().join("prefill.sock").exists());
    assert!(!dir.path().join("connector.sock").exists());
}

#[tokio::test]
async fn test_bind_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = PDConfig {
        connector_addr: "udp://127.0.0.1:5555".into(),
        ..socket_config(dir.path())
    };
    let err = PDCoordinator::bind(config).await.err().unwrap();
    assert!(err.is_validation(), "{err:?}");
}
