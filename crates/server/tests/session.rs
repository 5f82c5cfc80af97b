//! End-to-end protocol sessions against a live server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ctproto_protocol::{pack_chunk, ChunkSidecar, Message, CHUNK_SIZE};
use ctproto_server::{
    Handler, HandlerError, HandlerFuture, Server, ServerConfig, UploadRequest,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_auth(&self, payload: Value) -> HandlerFuture<'_, Result<Value, HandlerError>> {
        Box::pin(async move {
            match payload.get("token").and_then(Value::as_str) {
                Some("T") => Ok(json!({ "userId": "u1" })),
                _ => Err("bad token".into()),
            }
        })
    }

    fn on_message(
        &self,
        message: Message,
    ) -> HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            match message.msg_type.as_deref() {
                Some("echo") => Ok(Some(message.payload)),
                _ => Ok(None),
            }
        })
    }

    fn on_upload_message(
        &self,
        request: UploadRequest,
    ) -> HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            let name = request
                .payload
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("file");
            Ok(Some(json!({
                "path": format!("/tmp/{name}"),
                "size": request.file.len(),
            })))
        })
    }
}

async fn start_server() -> (Arc<Server<EchoHandler>>, String) {
    let mut config = ServerConfig::new(0);
    config.disable_logs = true;
    let server = Server::new(config, EchoHandler);

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });

    for _ in 0..100 {
        if server.local_addr().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let port = server.port().await;
    assert!(port > 0, "server failed to bind");
    (server, format!("ws://localhost:{port}/"))
}

async fn open(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn recv_msg(ws: &mut Ws) -> Message {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("read error")
        {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn recv_close(ws: &mut Ws) -> (CloseCode, String) {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("read error")
        {
            WsMessage::Close(Some(frame)) => {
                return (frame.code, frame.reason.as_ref().to_owned())
            }
            WsMessage::Close(None) => return (CloseCode::Status, String::new()),
            _ => continue,
        }
    }
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

async fn authorize(ws: &mut Ws) -> Message {
    send_text(
        ws,
        r#"{"type":"authorize","messageId":"abcdefghij","payload":{"token":"T"}}"#,
    )
    .await;
    recv_msg(ws).await
}

#[tokio::test]
async fn happy_auth() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;

    let resp = authorize(&mut ws).await;
    assert_eq!(resp.message_id, "abcdefghij");
    assert!(resp.is_response());
    assert_eq!(resp.payload, json!({ "userId": "u1" }));
}

#[tokio::test]
async fn silent_connection_times_out() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, CloseCode::Again);
    assert_eq!(reason, "Authorization required");
}

#[tokio::test]
async fn wrong_first_message_is_rejected() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;

    send_text(
        &mut ws,
        r#"{"type":"ping","messageId":"0123456789","payload":{}}"#,
    )
    .await;

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "Unauthorized");
}

#[tokio::test]
async fn failed_authorization_closes_with_reason() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;

    send_text(
        &mut ws,
        r#"{"type":"authorize","messageId":"abcdefghij","payload":{"token":"WRONG"}}"#,
    )
    .await;

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "Authorization failed: bad token");
}

#[tokio::test]
async fn format_error_gets_error_response_without_close() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    send_text(&mut ws, r#"{"foo":"bar"}"#).await;

    let err = recv_msg(&mut ws).await;
    assert_eq!(err.msg_type.as_deref(), Some("error"));
    assert_eq!(
        err.payload["error"],
        "Message Format Error: 'messageId' field missed"
    );

    // The connection survived; a normal request still round-trips.
    send_text(
        &mut ws,
        r#"{"type":"echo","messageId":"echo000001","payload":{"v":1}}"#,
    )
    .await;
    let resp = recv_msg(&mut ws).await;
    assert_eq!(resp.message_id, "echo000001");
    assert_eq!(resp.payload["v"], 1);
}

#[tokio::test]
async fn unparseable_text_closes_connection() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    send_text(&mut ws, "definitely not json").await;

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, CloseCode::Unsupported);
    assert_eq!(reason, "Unsupported data");
}

#[tokio::test]
async fn binary_before_authorization_closes_connection() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;

    ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, CloseCode::Unsupported);
    assert_eq!(reason, "Unsupported data");
}

#[tokio::test]
async fn duplicate_authorize_is_silently_ignored() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    send_text(
        &mut ws,
        r#"{"type":"authorize","messageId":"dupdupdup0","payload":{"token":"T"}}"#,
    )
    .await;

    // No response, no close; the next request answers normally.
    send_text(
        &mut ws,
        r#"{"type":"echo","messageId":"echo000002","payload":{"v":2}}"#,
    )
    .await;
    let resp = recv_msg(&mut ws).await;
    assert_eq!(resp.message_id, "echo000002");
    assert_eq!(resp.payload["v"], 2);
}

#[tokio::test]
async fn unhandled_type_gets_no_response() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    send_text(
        &mut ws,
        r#"{"type":"nobody-home","messageId":"nohandler0","payload":{}}"#,
    )
    .await;
    // on_message returned None; only the following echo answers.
    send_text(
        &mut ws,
        r#"{"type":"echo","messageId":"echo000003","payload":{"v":3}}"#,
    )
    .await;
    let resp = recv_msg(&mut ws).await;
    assert_eq!(resp.message_id, "echo000003");
}

#[tokio::test]
async fn upload_completes_with_per_chunk_acks() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    let file: Vec<u8> = (0..25_000u32).map(|i| (i % 13) as u8).collect();
    let file_id = "fileupload";

    for (n, piece) in file.chunks(CHUNK_SIZE).enumerate() {
        let n = n as u32;
        let message_id = format!("chunkmsg{n:02}");
        let sidecar = if n == 0 {
            ChunkSidecar::opening("store", json!({ "name": "f" }), 3, &message_id)
        } else {
            ChunkSidecar::continuation(&message_id)
        };
        let frame = pack_chunk(file_id, n, piece, &sidecar).unwrap();
        ws.send(WsMessage::Binary(frame)).await.unwrap();

        let ack = recv_msg(&mut ws).await;
        assert_eq!(ack.message_id, message_id);
        assert_eq!(ack.payload["chunkNumber"], n);
        assert_eq!(ack.payload["fileId"], file_id);
        assert_eq!(ack.payload["type"], "store");
    }

    // Completion is keyed by the file id and carries the application's
    // return value.
    let done = recv_msg(&mut ws).await;
    assert_eq!(done.message_id, file_id);
    assert_eq!(done.payload["path"], "/tmp/f");
    assert_eq!(done.payload["size"], 25_000);
}

#[tokio::test]
async fn malformed_chunk_gets_error_response() {
    let (_server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    // Valid length, invalid file id alphabet.
    let sidecar = ChunkSidecar::continuation("msgchunk00");
    let mut frame = pack_chunk("goodfileid", 0, b"x", &sidecar).unwrap();
    frame[0] = b'*';
    ws.send(WsMessage::Binary(frame)).await.unwrap();

    let err = recv_msg(&mut ws).await;
    assert_eq!(err.msg_type.as_deref(), Some("error"));
    assert_eq!(err.payload["error"], "Message Format Error: Invalid file id");
}

#[tokio::test]
async fn registry_tracks_and_broadcasts() {
    let (server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    for _ in 0..100 {
        if server.clients().len().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = server
        .clients()
        .find(|c| c.auth_data["userId"] == "u1")
        .current()
        .await
        .expect("authorized client is registered");
    assert_eq!(record.auth_data["userId"], "u1");

    server
        .clients()
        .find(|c| c.auth_data["userId"] == "u1")
        .send("refresh", json!({ "seq": 1 }))
        .await;

    let update = recv_msg(&mut ws).await;
    assert_eq!(update.msg_type.as_deref(), Some("refresh"));
    assert_eq!(update.payload["seq"], 1);
}

#[tokio::test]
async fn disconnect_removes_client_record() {
    let (server, url) = start_server().await;
    let mut ws = open(&url).await;
    authorize(&mut ws).await;

    for _ in 0..100 {
        if server.clients().len().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ws.close(None).await.unwrap();
    drop(ws);

    for _ in 0..100 {
        if server.clients().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.clients().is_empty().await);
}

#[tokio::test]
async fn mount_path_is_enforced() {
    let mut config = ServerConfig::new(0);
    config.disable_logs = true;
    config.path = Some("/ctproto".into());
    let server = Server::new(config, EchoHandler);

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    for _ in 0..100 {
        if server.local_addr().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let port = server.port().await;

    // Wrong path is rejected during the upgrade.
    assert!(connect_async(format!("ws://localhost:{port}/other"))
        .await
        .is_err());

    // Mounted path works end to end.
    let mut ws = open(&format!("ws://localhost:{port}/ctproto")).await;
    let resp = authorize(&mut ws).await;
    assert_eq!(resp.payload["userId"], "u1");
}
