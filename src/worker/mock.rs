//! In-memory protocol peer used by unit tests in this crate.
//!
//! Speaks the framed protocol over a duplex transport and implements a
//! tiny workspace so handle and manager tests run without real processes.

use std::collections::HashMap;

use tokio::io::{split, DuplexStream};

use crate::channel::{read_frame, write_frame, Message, MessageKind};

/// Serve the worker side of the protocol until shutdown or EOF.
pub(crate) async fn spawn_mock_worker(transport: DuplexStream) {
    let (mut reader, mut writer) = split(transport);
    let mut workspace: HashMap<String, Vec<u8>> = HashMap::new();

    while let Ok(Some(request)) = read_frame(&mut reader).await {
        match request.kind {
            MessageKind::Execute => {
                let value: serde_json::Value =
                    serde_json::from_slice(&request.payload).expect("execute payload");
                let source = value["source"].as_str().expect("source").to_string();

                if source.contains("slow") {
                    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                }
                if source.contains("emit_log") {
                    let payload = serde_json::to_vec(&serde_json::json!({
                        "line": "INFO worker chatter"
                    }))
                    .expect("output payload");
                    let _ = write_frame(
                        &mut writer,
                        &Message::new(0, MessageKind::Output, payload),
                    )
                    .await;
                }
                if source.contains("stale") {
                    // Response for a request nobody is waiting on.
                    let payload = serde_json::to_vec(&serde_json::json!({
                        "stdout": "ignore me", "stderr": ""
                    }))
                    .expect("stale payload");
                    let _ = write_frame(
                        &mut writer,
                        &Message::new(request.id + 1000, MessageKind::Success, payload),
                    )
                    .await;
                }

                let response = if source.contains("boom") {
                    let payload = serde_json::to_vec(&serde_json::json!({
                        "message": "execution failed"
                    }))
                    .expect("failure payload");
                    Message::new(request.id, MessageKind::Failure, payload)
                } else {
                    let payload = serde_json::to_vec(&serde_json::json!({
                        "stdout": source, "stderr": ""
                    }))
                    .expect("success payload");
                    Message::new(request.id, MessageKind::Success, payload)
                };
                let _ = write_frame(&mut writer, &response).await;
            }
            MessageKind::PutVariable => {
                // Payload layout: [u32 header_len][header json][column bytes].
                // Stored verbatim so a later get echoes the same layout.
                let header_len =
                    u32::from_le_bytes(request.payload[..4].try_into().expect("header len"))
                        as usize;
                let header: serde_json::Value =
                    serde_json::from_slice(&request.payload[4..4 + header_len])
                        .expect("variable header");
                let name = header["name"].as_str().expect("name").to_string();
                workspace.insert(name, request.payload.clone());
                let _ = write_frame(
                    &mut writer,
                    &Message::new(request.id, MessageKind::Success, Vec::new()),
                )
                .await;
            }
            MessageKind::GetVariable => {
                let value: serde_json::Value =
                    serde_json::from_slice(&request.payload).expect("get payload");
                let name = value["name"].as_str().expect("name");
                let response = match workspace.get(name) {
                    Some(stored) => {
                        Message::new(request.id, MessageKind::Success, stored.clone())
                    }
                    None => {
                        let payload = serde_json::to_vec(&serde_json::json!({
                            "message": format!("no variable named '{}'", name)
                        }))
                        .expect("failure payload");
                        Message::new(request.id, MessageKind::Failure, payload)
                    }
                };
                let _ = write_frame(&mut writer, &response).await;
            }
            MessageKind::ListVariables => {
                let payload = serde_json::to_vec(&serde_json::json!([
                    { "name": "xs", "type_name": "i64", "value": "[1, 2, 3]" }
                ]))
                .expect("listing payload");
                let _ = write_frame(
                    &mut writer,
                    &Message::new(request.id, MessageKind::Success, payload),
                )
                .await;
            }
            MessageKind::AutoComplete => {
                let payload = serde_json::to_vec(&serde_json::json!([
                    { "name": "sum", "kind": "method", "doc": "Sum of values" },
                    { "name": "size", "kind": "method", "doc": null }
                ]))
                .expect("suggestion payload");
                let _ = write_frame(
                    &mut writer,
                    &Message::new(request.id, MessageKind::Success, payload),
                )
                .await;
            }
            MessageKind::Shutdown => break,
            _ => {}
        }
    }
}
