//! End-to-end lifecycle tests: queue checkout, manager dispatch and
//! reconfiguration over transport-backed workers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{duplex, split, DuplexStream};
use tokio_util::sync::CancellationToken;

use koi_core::channel::{read_frame, write_frame, Message, MessageKind};
use koi_core::codec::{Column, ColumnValues};
use koi_core::config::QueueSettings;
use koi_core::error::Result;
use koi_core::manager::WorkerManager;
use koi_core::pool::{ModuleSpec, PoolKey, WorkerFactory, WorkerQueue};
use koi_core::worker::{BackendKind, LaunchSpec, WorkerHandle, WorkerOptions};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Minimal protocol peer: executes echo back their source, variables are
/// stored verbatim and echoed on get.
async fn serve_peer(transport: DuplexStream) {
    let (mut reader, mut writer) = split(transport);
    let mut workspace: HashMap<String, Vec<u8>> = HashMap::new();

    while let Ok(Some(request)) = read_frame(&mut reader).await {
        match request.kind {
            MessageKind::Execute => {
                let value: serde_json::Value =
                    serde_json::from_slice(&request.payload).expect("execute payload");
                let source = value["source"].as_str().expect("source");
                let payload = serde_json::to_vec(&serde_json::json!({
                    "stdout": source, "stderr": ""
                }))
                .expect("response payload");
                let _ = write_frame(
                    &mut writer,
                    &Message::new(request.id, MessageKind::Success, payload),
                )
                .await;
            }
            MessageKind::PutVariable => {
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
            MessageKind::Shutdown => break,
            _ => {}
        }
    }
}

/// Factory producing workers over in-memory transports, so pool and
/// manager semantics run without real interpreter processes.
struct TransportFactory;

impl WorkerFactory for TransportFactory {
    type Worker = WorkerHandle;

    async fn create(&self, key: &PoolKey) -> Result<WorkerHandle> {
        let (ours, theirs) = duplex(16 * 1024);
        tokio::spawn(serve_peer(theirs));
        let (reader, writer) = split(ours);
        Ok(WorkerHandle::from_transport(reader, writer, key.backend()))
    }
}

fn test_key() -> PoolKey {
    PoolKey::new(
        LaunchSpec::new("python3").with_args(["-u", "worker_main.py"]),
        BackendKind::Current,
        vec![ModuleSpec::new("numpy")],
        vec![ModuleSpec::new("pandas")],
    )
}

#[tokio::test]
async fn checkout_execute_and_columns_roundtrip() {
    init_tracing();
    let settings = QueueSettings::default();
    let queue = WorkerQueue::new(Arc::new(TransportFactory), settings.pool_config());
    let key = test_key();
    let cancel = CancellationToken::new();

    let worker = queue
        .checkout(&key, &WorkerOptions::default(), &cancel)
        .await
        .expect("checkout");

    let (stdout, stderr) = worker.execute("print('hello')").await.expect("execute");
    assert_eq!(stdout, "print('hello')");
    assert_eq!(stderr, "");

    let column = Column::new(
        ColumnValues::F64(vec![1.5, 0.0, -2.25]),
        vec![false, true, false],
    )
    .expect("column");
    worker.put_variable("measurements", &column).await.expect("put");
    let fetched = worker.get_variable("measurements").await.expect("get");
    assert_eq!(fetched, column);

    worker.close().await;
    queue.close().await;
}

#[tokio::test]
async fn manager_dispatches_over_pooled_workers() {
    init_tracing();
    let queue = WorkerQueue::new(
        Arc::new(TransportFactory),
        QueueSettings::default().pool_config(),
    );
    let key = test_key();
    let cancel = CancellationToken::new();

    let first = Arc::new(
        queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .expect("first checkout"),
    );
    let manager = WorkerManager::new(first);

    let (tx, rx) = tokio::sync::oneshot::channel();
    manager.execute(
        "step one".into(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let (stdout, _) = rx.await.expect("handler fired").expect("execute");
    assert_eq!(stdout, "step one");

    // Hot-swap to a second pooled worker; the old one goes back to being
    // the caller's to close.
    let second = Arc::new(
        queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .expect("second checkout"),
    );
    let old = manager.swap(second);
    old.close().await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    manager.execute(
        "step two".into(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let (stdout, _) = rx.await.expect("handler fired").expect("execute");
    assert_eq!(stdout, "step two");

    manager.close().await;
    queue.close().await;
}

#[tokio::test]
async fn environment_change_invalidates_and_queue_reconfigures() {
    init_tracing();
    let queue = WorkerQueue::new(
        Arc::new(TransportFactory),
        QueueSettings::default().pool_config(),
    );
    let key = test_key();
    let cancel = CancellationToken::new();

    let worker = queue
        .checkout(&key, &WorkerOptions::default(), &cancel)
        .await
        .expect("checkout");
    worker.close().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(queue.idle_count().await, 1);

    // Installation changed: every idle worker is dropped, no replacement.
    queue.invalidate_all().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(queue.idle_count().await, 0);
    assert_eq!(queue.slot_count().await, 0);

    // New tuning swaps the whole pool; the queue keeps serving.
    let smaller = QueueSettings {
        max_idle_workers: Some(1),
        expiration_minutes: Some(1),
        task_width: None,
    };
    queue.reconfigure(smaller.pool_config()).await;
    let worker = queue
        .checkout(&key, &WorkerOptions::default(), &cancel)
        .await
        .expect("checkout after reconfigure");
    worker.close().await;
    queue.close().await;
}
