use std::path::{Path, PathBuf};
use std::time::Duration;

use bscript_host::control::{ControlClient, RequestEnvelope};
use bscript_host::{HostConfig, HostError};
use bscript_kernel::{ExecutionReply, Notification, Output, ShutdownReport};
use bscript_testkit::{BackendProbe, ScriptLoader, test_config};
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct Served {
    _dir: TempDir,
    sock_path: PathBuf,
    probe: BackendProbe,
    handle: JoinHandle<Result<ShutdownReport, HostError>>,
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket {} never appeared", path.display());
}

async fn start() -> Served {
    let dir = TempDir::new().unwrap();
    let sock_path = dir.path().join("control.sock");
    let config = HostConfig {
        control_socket: sock_path.clone(),
        kernel: test_config(),
        ..HostConfig::default()
    };
    let probe = BackendProbe::new();
    let loader = Box::new(ScriptLoader::new(probe.clone()));
    let handle = tokio::spawn(bscript_host::serve(config, loader));
    wait_for_socket(&sock_path).await;
    Served {
        _dir: dir,
        sock_path,
        probe,
        handle,
    }
}

fn reply(value: serde_json::Value) -> ExecutionReply {
    serde_json::from_value(value).unwrap()
}

/// execute -> history -> kernel-info -> shutdown over one connection.
#[tokio::test]
async fn control_channel_round_trip() {
    let served = start().await;
    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();

    let define = client
        .call("execute", json!({ "session": "A", "execution_counter": 1, "code": "x = 20" }))
        .await
        .unwrap();
    assert_eq!(reply(define), ExecutionReply::success(1, Vec::new()));

    let read = client
        .call("execute", json!({ "session": "A", "execution_counter": 2, "code": "x * 2" }))
        .await
        .unwrap();
    assert_eq!(reply(read), ExecutionReply::success(2, vec![Output::value("40")]));

    let history = client
        .call("history", json!({ "session": "A", "last_n": 5 }))
        .await
        .unwrap();
    let codes: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["x = 20", "x * 2"]);

    let info = client.call("kernel-info", json!({})).await.unwrap();
    assert_eq!(info["implementation"], "bscript");
    assert_eq!(info["language_info"]["name"], "BraneScript");

    let report = client.call("shutdown", json!({})).await.unwrap();
    assert_eq!(report, json!({ "freed": 1, "failed": 0 }));

    let done = served.handle.await.unwrap().unwrap();
    assert_eq!(done, ShutdownReport { freed: 1, failed: 0 });
    assert_eq!(served.probe.live_instances(), 0);
    assert!(!served.sock_path.exists());
}

#[tokio::test]
async fn execute_defaults_session_and_counter_per_connection() {
    let served = start().await;
    let mut first = ControlClient::connect(&served.sock_path).await.unwrap();
    let mut second = ControlClient::connect(&served.sock_path).await.unwrap();

    let a = reply(first.call("execute", json!({ "code": "y = 1" })).await.unwrap());
    let b = reply(first.call("execute", json!({ "code": "y" })).await.unwrap());
    assert_eq!(a.execution_counter(), 1);
    assert_eq!(b, ExecutionReply::success(2, vec![Output::value("1")]));

    // A different connection gets its own session.
    let other = reply(second.call("execute", json!({ "code": "y" })).await.unwrap());
    assert_eq!(other.execution_counter(), 1);
    assert_eq!(other.ename(), Some("NameError"));

    let session = first.call("session", json!({})).await.unwrap();
    assert!(session["session"].as_str().is_some_and(|s| !s.is_empty()));

    first.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn error_replies_are_successful_requests() {
    let served = start().await;
    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();

    let resp = client
        .request(&RequestEnvelope::new(
            "execute",
            json!({ "session": "B", "execution_counter": 3, "code": "1 / 0" }),
        ))
        .await
        .unwrap();
    assert!(resp.ok, "{:?}", resp.error);
    let result = reply(resp.result.unwrap());
    assert_eq!(result.ename(), Some("ZeroDivisionError"));
    assert_eq!(result.execution_counter(), 3);

    client.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn queries_round_trip() {
    let served = start().await;
    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();
    client
        .call("execute", json!({ "session": "Q", "code": "counter = 3" }))
        .await
        .unwrap();

    let matches = client
        .call("complete", json!({ "session": "Q", "code": "cou" }))
        .await
        .unwrap();
    assert_eq!(matches["cursor_start"], 0);
    assert_eq!(matches["cursor_end"], 3);
    assert!(
        matches["matches"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m == "counter")
    );

    let incomplete = client
        .call("is-complete", json!({ "code": "x = (1 +" }))
        .await
        .unwrap();
    assert_eq!(incomplete["status"], "incomplete");

    let complete = client
        .call("is-complete", json!({ "code": "x = 1" }))
        .await
        .unwrap();
    assert_eq!(complete["status"], "complete");

    client.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn subscriber_receives_execute_results() {
    let served = start().await;
    let mut subscriber = ControlClient::connect(&served.sock_path).await.unwrap();
    let ack = subscriber.call("subscribe", json!({})).await.unwrap();
    assert_eq!(ack, json!({ "subscribed": true }));

    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();
    client
        .call("execute", json!({ "session": "S", "execution_counter": 7, "code": "print(\"hi\")" }))
        .await
        .unwrap();
    // Silent executions publish nothing.
    client
        .call("execute", json!({ "session": "S", "code": "1", "silent": true }))
        .await
        .unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(5), subscriber.next_notification())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        notification,
        Some(Notification::ExecuteResult {
            session: "S".into(),
            execution_counter: 7,
            outputs: vec![Output::stdout("hi\n")],
        })
    );

    client.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
    // The stream ends once the host is gone.
    let tail = tokio::time::timeout(Duration::from_secs(5), subscriber.next_notification())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tail, None);
}

#[tokio::test]
async fn interrupt_is_delivered_while_idle() {
    let served = start().await;
    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();

    let resp = client.call("interrupt", json!({})).await.unwrap();
    assert_eq!(resp, json!({ "delivered": true }));

    client.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn protocol_errors() {
    let served = start().await;
    let mut client = ControlClient::connect(&served.sock_path).await.unwrap();

    let unknown = client
        .request(&RequestEnvelope::new("send-event", json!({})))
        .await
        .unwrap();
    assert!(!unknown.ok);
    assert_eq!(unknown.error.unwrap().code, "unknown_method");

    let mut stale = RequestEnvelope::new("kernel-info", json!({}));
    stale.v = 9;
    let resp = client.request(&stale).await.unwrap();
    assert_eq!(resp.id, stale.id);
    assert_eq!(resp.error.unwrap().code, "invalid_request");

    let bad_payload = client
        .request(&RequestEnvelope::new("execute", json!({ "session": "A" })))
        .await
        .unwrap();
    assert_eq!(bad_payload.error.unwrap().code, "decode_error");

    client.call("shutdown", json!({})).await.unwrap();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn serve_fails_when_the_backend_does_not_load() {
    let dir = TempDir::new().unwrap();
    let sock_path = dir.path().join("control.sock");
    let config = HostConfig {
        control_socket: sock_path.clone(),
        kernel: test_config(),
        ..HostConfig::default()
    };
    let probe = BackendProbe::new();
    probe.fail_load(true);

    let err = bscript_host::serve(config, Box::new(ScriptLoader::new(probe)))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Initialization(ref reason) if reason.contains("script-backend")));
    assert!(!sock_path.exists());
}
