//! Command bridge for the order-entry webview host.
//!
//! Reads one JSON request per line on stdin, `{"id", "cmd", "args"}`, and
//! answers one line on stdout per request, `{"id", "ok"}` or `{"id", "error"}`.
//! Requests run concurrently, so replies may come back out of order.

use anyhow::Context;
use order_desk_lib::{commands, diagnostics, init_logging, AppState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    #[serde(default)]
    id: Value,
    #[serde(alias = "command")]
    cmd: String,
    #[serde(default, alias = "payload")]
    args: Option<Value>,
}

/// Decode one request line, or the error reply to send back for it.
fn parse_request(line: &str) -> Result<BridgeRequest, Value> {
    serde_json::from_str(line).map_err(|e| {
        warn!(error = %e, "malformed bridge request");
        json!({ "id": Value::Null, "error": format!("Malformed request: {e}") })
    })
}

fn reply(id: Value, result: Result<Value, String>) -> Value {
    match result {
        Ok(value) => json!({ "id": id, "ok": value }),
        Err(e) => json!({ "id": id, "error": e }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();

    let data_dir = diagnostics::get_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;
    let state = AppState::open(&data_dir)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to initialize database")?;
    let state = Arc::new(state);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    info!(data_dir = %data_dir.display(), "command bridge ready");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        while tasks.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(r) => r,
            Err(error_reply) => {
                let _ = tx.send(error_reply.to_string());
                continue;
            }
        };

        let state = Arc::clone(&state);
        let tx = tx.clone();
        tasks.spawn(async move {
            let result = commands::invoke(&state, &request.cmd, request.args).await;
            if let Err(e) = &result {
                error!(command = %request.cmd, error = %e, "command failed");
            }
            let _ = tx.send(reply(request.id, result).to_string());
        });
    }

    // stdin closed: let in-flight commands answer before exiting.
    while tasks.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    info!("command bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_accepts_aliases() {
        let request = parse_request(r#"{"id":7,"command":"cart_get","payload":{"cartId":"c"}}"#)
            .expect("parse");
        assert_eq!(request.id, json!(7));
        assert_eq!(request.cmd, "cart_get");
        assert_eq!(request.args, Some(json!({ "cartId": "c" })));

        let bare = parse_request(r#"{"cmd":"app_about"}"#).expect("parse");
        assert!(bare.id.is_null());
        assert!(bare.args.is_none());
    }

    #[test]
    fn parse_request_failure_is_an_error_reply() {
        let error_reply = parse_request("{not json").expect_err("malformed");
        assert!(error_reply["id"].is_null());
        assert!(error_reply["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("Malformed request")));
    }

    #[test]
    fn reply_carries_ok_or_error() {
        let ok = reply(json!("r-1"), Ok(json!({ "success": true })));
        assert_eq!(ok, json!({ "id": "r-1", "ok": { "success": true } }));

        let failed = reply(json!(2), Err("Cart not found: x".to_string()));
        assert_eq!(failed, json!({ "id": 2, "error": "Cart not found: x" }));
        assert!(failed.get("ok").is_none());
    }

    #[tokio::test]
    async fn request_round_trips_through_dispatcher() {
        let dir = std::env::temp_dir().join(format!("order_desk_bridge_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let state = AppState::open(&dir).expect("open state");

        let request = parse_request(r#"{"id":1,"cmd":"cart_open"}"#).expect("parse");
        let result = commands::invoke(&state, &request.cmd, request.args).await;
        let line = reply(request.id, result);
        assert_eq!(line["id"], 1);
        assert!(line["ok"]["cart"]["id"].is_string());

        let request = parse_request(r#"{"id":2,"cmd":"cart_get","args":{"cartId":"gone"}}"#)
            .expect("parse");
        let result = commands::invoke(&state, &request.cmd, request.args).await;
        let line = reply(request.id, result);
        assert_eq!(line["error"], "Cart not found: gone");

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
