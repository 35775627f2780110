//! HTTP instance client tests against a local fake instance manager.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pg_backup_core::{
    BackupModePhase, Error, HttpInstanceClient, InstanceClient, InstanceConfig, InstanceError,
    StartBackupRequest, StopBackupRequest,
};

use super::helpers::{BEGIN_WAL, END_WAL};

/// Serve `handler` on a loopback port until the test runtime shuts down
async fn serve<H>(handler: H) -> SocketAddr
where
    H: Fn(&Method, &str, &[u8]) -> (u16, String) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let (status, body) = handler(&method, path.as_str(), &body[..]);
                        let response = Response::builder()
                            .status(status)
                            .header("Content-Type", "application/json")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap();
                        Ok::<_, hyper::Error>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Accept connections and never answer
async fn serve_silently() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

fn instance_config(addr: SocketAddr) -> InstanceConfig {
    InstanceConfig {
        host: addr.ip().to_string(),
        status_port: addr.port(),
        backup_port: addr.port(),
        ..Default::default()
    }
}

fn client(addr: SocketAddr) -> HttpInstanceClient {
    HttpInstanceClient::new(&instance_config(addr)).unwrap()
}

fn control_data(wal: &str) -> String {
    json!({
        "data": format!(
            "Database cluster state:               in production\n\
             Latest checkpoint's REDO location:    0/3000028\n\
             Latest checkpoint's REDO WAL file:    {}\n",
            wal
        )
    })
    .to_string()
}

fn status_body(phase: &str) -> String {
    json!({
        "data": {
            "phase": phase,
            "backupName": "b1",
            "beginLSN": "0/3000028",
            "endLSN": "0/5000100",
            "labelFile": "U1RBUlQgV0FMIExPQ0FUSU9OOiAwLzMwMDAwMjg=",
            "spcmapFile": ""
        }
    })
    .to_string()
}

/// Requests seen by a fake server: method, path and body
#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<(Method, String, Value)>>>);

impl Recorded {
    fn push(&self, method: &Method, path: &str, body: &[u8]) {
        let body = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.0.lock().push((method.clone(), path.to_string(), body));
    }

    fn all(&self) -> Vec<(Method, String, Value)> {
        self.0.lock().clone()
    }
}

// ============================================================================
// Control data
// ============================================================================

#[tokio::test]
async fn reads_current_wal_file_from_control_data() {
    let addr = serve(|method, path, _| {
        assert_eq!(method, Method::GET);
        assert_eq!(path, "/pg/controldata");
        (200, control_data(BEGIN_WAL))
    })
    .await;

    let client = client(addr);
    let cancel = CancellationToken::new();

    let pairs = client.control_data(&cancel).await.unwrap();
    assert_eq!(pairs["Database cluster state"], "in production");
    assert_eq!(client.current_wal_file(&cancel).await.unwrap(), BEGIN_WAL);
}

#[tokio::test]
async fn missing_wal_key_is_invalid_response() {
    let addr = serve(|_, _, _| {
        (200, json!({ "data": "Database cluster state: in production\n" }).to_string())
    })
    .await;

    let err = client(addr)
        .current_wal_file(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Instance(InstanceError::InvalidResponse { .. })
    ));
}

// ============================================================================
// Backup mode requests
// ============================================================================

#[tokio::test]
async fn start_posts_forced_request() {
    let recorded = Recorded::default();
    let seen = recorded.clone();
    let addr = serve(move |method, path, body| {
        seen.push(method, path, body);
        (200, json!({ "data": {} }).to_string())
    })
    .await;

    client(addr)
        .start_backup(&StartBackupRequest::forced("b1"), &CancellationToken::new())
        .await
        .unwrap();

    let requests = recorded.all();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, Method::POST);
    assert_eq!(requests[0].1, "/pg/mode/backup");
    assert_eq!(
        requests[0].2,
        json!({
            "immediateCheckpoint": true,
            "waitForArchive": true,
            "backupName": "b1",
            "force": true
        })
    );
}

#[tokio::test]
async fn stop_puts_backup_name() {
    let recorded = Recorded::default();
    let seen = recorded.clone();
    let addr = serve(move |method, path, body| {
        seen.push(method, path, body);
        (200, String::new())
    })
    .await;

    client(addr)
        .stop_backup(
            &StopBackupRequest {
                backup_name: "b1".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let requests = recorded.all();
    assert_eq!(requests[0].0, Method::PUT);
    assert_eq!(requests[0].2, json!({ "backupName": "b1" }));
}

#[tokio::test]
async fn status_decodes_completed_result() {
    let addr = serve(|_, _, _| (200, status_body("completed"))).await;

    let status = client(addr)
        .backup_status(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status.phase, BackupModePhase::Completed);
    assert_eq!(status.backup_name, "b1");
    assert_eq!(status.begin_lsn, "0/3000028");
    assert_eq!(status.end_lsn, "0/5000100");
    assert_eq!(status.label_file, b"START WAL LOCATION: 0/3000028".to_vec());
    assert!(status.spcmap_file.is_empty());
}

#[tokio::test]
async fn unknown_status_phase_is_tolerated() {
    let addr = serve(|_, _, _| {
        (200, json!({ "data": { "phase": "rebooting" } }).to_string())
    })
    .await;

    let status = client(addr)
        .backup_status(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status.phase, BackupModePhase::Unknown);
}

// ============================================================================
// Error responses
// ============================================================================

#[tokio::test]
async fn error_envelope_is_status_error() {
    let addr = serve(|_, _, _| {
        (
            200,
            json!({ "error": { "code": "BUSY", "message": "another backup is running" } })
                .to_string(),
        )
    })
    .await;

    let err = client(addr)
        .start_backup(&StartBackupRequest::forced("b1"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Instance(InstanceError::Status {
            status, message, ..
        }) => {
            assert_eq!(status, 200);
            assert_eq!(message, "BUSY: another backup is running");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_success_status_is_status_error() {
    let addr = serve(|_, _, _| (503, "instance not ready".to_string())).await;

    let err = client(addr)
        .backup_status(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Instance(InstanceError::Status { status: 503, ref message, .. })
            if message == "instance not ready"
    ));
}

#[tokio::test]
async fn status_without_data_is_invalid_response() {
    let addr = serve(|_, _, _| (200, "{}".to_string())).await;

    let err = client(addr)
        .backup_status(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Instance(InstanceError::InvalidResponse { .. })
    ));
}

// ============================================================================
// Transport
// ============================================================================

#[tokio::test]
async fn refused_connection_is_connection_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = client(addr)
        .control_data(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Instance(InstanceError::Connection { .. })
    ));
}

#[tokio::test]
async fn slow_instance_times_out() {
    let addr = serve_silently().await;
    let config = InstanceConfig {
        request_timeout_ms: 200,
        ..instance_config(addr)
    };
    let client = HttpInstanceClient::new(&config).unwrap();

    let err = client
        .backup_status(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "unexpected error: {err}");
    match err {
        Error::Instance(InstanceError::Timeout { timeout, .. }) => {
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_interrupts_pending_request() {
    let addr = serve_silently().await;
    let client = client(addr);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = client.backup_status(&cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(!err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(10));
}

// ============================================================================
// Full backup and restore through the public entry points
// ============================================================================

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use pg_backup_core::storage::StorageBackendConfig;
    use pg_backup_core::{perform_backup, restore, Config, RetryPolicy};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Instance manager that confirms every transition after one poll
    #[derive(Default)]
    struct Manager {
        phase: &'static str,
        pending_polls: u32,
        control_data_calls: u32,
        requests: Vec<(Method, String)>,
    }

    impl Manager {
        fn handle(&mut self, method: &Method, path: &str) -> (u16, String) {
            self.requests.push((method.clone(), path.to_string()));
            match (method.as_str(), path) {
                ("GET", "/pg/controldata") => {
                    self.control_data_calls += 1;
                    let wal = if self.control_data_calls == 1 {
                        BEGIN_WAL
                    } else {
                        END_WAL
                    };
                    (200, control_data(wal))
                }
                ("POST", "/pg/mode/backup") => {
                    self.phase = "starting";
                    self.pending_polls = 1;
                    (200, json!({ "data": {} }).to_string())
                }
                ("PUT", "/pg/mode/backup") => {
                    self.phase = "closing";
                    self.pending_polls = 1;
                    (200, json!({ "data": {} }).to_string())
                }
                ("GET", "/pg/mode/backup") => {
                    if self.pending_polls > 0 {
                        self.pending_polls -= 1;
                    } else if self.phase == "starting" {
                        self.phase = "started";
                    } else if self.phase == "closing" {
                        self.phase = "completed";
                    }
                    (200, status_body(self.phase))
                }
                _ => (404, "not found".to_string()),
            }
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn backup_and_restore_through_filesystem_bucket() {
        let root = tempfile::TempDir::new().unwrap();
        let tools = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("b")).unwrap();
        let replayed = tools.path().join("replayed.sql");

        let manager = Arc::new(Mutex::new(Manager::default()));
        let state = manager.clone();
        let addr = serve(move |method, path, _| state.lock().handle(method, path)).await;

        let mut config = Config::new(StorageBackendConfig::Filesystem {
            root: root.path().to_path_buf(),
            bucket: "placeholder".to_string(),
            prefix: String::new(),
        });
        config.instance = instance_config(addr);
        config.working_dir = root.path().join("work");
        config.snapshot.dump_command = script(
            tools.path(),
            "dump.sh",
            "echo 'CREATE TABLE t (id int);' > \"$4\"",
        );
        config.snapshot.replay_command = script(
            tools.path(),
            "replay.sh",
            &format!("cp \"$4\" {}", replayed.display()),
        );
        config.backup_mode.retry = RetryPolicy {
            steps: 5,
            initial_delay_ms: 5,
            factor: 2.0,
            jitter: 0.0,
            max_delay_ms: None,
        };

        let cancel = CancellationToken::new();
        let result = perform_backup(&config, "b", "p", &cancel).await.unwrap();

        assert_eq!(result.begin_wal, BEGIN_WAL);
        assert_eq!(result.end_wal, END_WAL);
        assert_eq!(result.end_lsn, "0/5000100");
        assert!(result.object_key.starts_with("p/"));
        assert!(result.object_key.ends_with(".sql.tar.gz"));
        assert!(root.path().join("b").join(&result.object_key).is_file());

        let methods: Vec<_> = manager
            .lock()
            .requests
            .iter()
            .map(|(m, _)| m.clone())
            .collect();
        let post = methods.iter().position(|m| m == Method::POST).unwrap();
        let put = methods.iter().position(|m| m == Method::PUT).unwrap();
        assert!(post < put);

        let archive = Path::new(&result.object_key)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        restore(&config, "b", "p", &archive, &cancel).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&replayed).unwrap(),
            "CREATE TABLE t (id int);\n"
        );
        let leftovers: Vec<_> = std::fs::read_dir(root.path().join("work"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }
}
