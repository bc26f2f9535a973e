//! Runtime daemon client
//!
//! JSON over HTTP/1.1. `unix://` addresses are served with a hyper client
//! connection over a tokio `UnixStream`; `tcp://`, `http://` and `https://`
//! addresses go through reqwest. All paths are rooted at
//! `/v1/namespaces/{ns}`.

use super::*;
use crate::error::{CtlError, RpcCode};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

enum Transport {
    Unix(PathBuf),
    Http { client: reqwest::Client, base: String },
}

/// Client for the runtime daemon's HTTP API
pub struct RemoteRuntime {
    address: String,
    transport: Transport,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl RemoteRuntime {
    pub fn new(address: &str) -> Result<Self> {
        let transport = if let Some(path) = address.strip_prefix("unix://") {
            Transport::Unix(PathBuf::from(path))
        } else if address.starts_with('/') {
            Transport::Unix(PathBuf::from(address))
        } else {
            let base = if let Some(hostport) = address.strip_prefix("tcp://") {
                format!("http://{}", hostport)
            } else if address.starts_with("http://") || address.starts_with("https://") {
                address.trim_end_matches('/').to_string()
            } else {
                return Err(CtlError::InvalidConfig(format!(
                    "unsupported runtime address {:?}",
                    address
                )));
            };
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| CtlError::internal(format!("failed to build HTTP client: {}", e)))?;
            Transport::Http { client, base }
        };

        Ok(Self {
            address: address.to_string(),
            transport,
        })
    }

    fn unreachable(&self, message: impl std::fmt::Display) -> CtlError {
        CtlError::Unreachable {
            address: self.address.clone(),
            message: message.to_string(),
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<(u16, Bytes)> {
        match &self.transport {
            Transport::Unix(socket) => {
                let stream = UnixStream::connect(socket)
                    .await
                    .map_err(|e| self.unreachable(e))?;
                let io = TokioIo::new(stream);

                let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                    .await
                    .map_err(|e| self.unreachable(format!("HTTP handshake failed: {}", e)))?;

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!("Runtime connection error: {}", e);
                    }
                });

                let builder = Request::builder()
                    .method(method)
                    .uri(format!("http://localhost{}", path))
                    .header("Host", "localhost");
                let request = match body {
                    Some(bytes) => builder
                        .header("Content-Type", "application/json")
                        .header("Content-Length", bytes.len())
                        .body(Full::new(Bytes::from(bytes))),
                    None => builder.body(Full::new(Bytes::new())),
                }
                .map_err(|e| CtlError::internal(format!("failed to build request: {}", e)))?;

                let response = sender
                    .send_request(request)
                    .await
                    .map_err(|e| self.unreachable(format!("failed to send request: {}", e)))?;
                let status = response.status().as_u16();
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| self.unreachable(format!("failed to read response: {}", e)))?
                    .to_bytes();
                Ok((status, body))
            }
            Transport::Http { client, base } => {
                let mut request = client.request(method, format!("{}{}", base, path));
                if let Some(bytes) = body {
                    request = request
                        .header("Content-Type", "application/json")
                        .body(bytes);
                }
                let response = request.send().await.map_err(|e| self.unreachable(e))?;
                let status = response.status().as_u16();
                let body = response.bytes().await.map_err(|e| self.unreachable(e))?;
                Ok((status, body))
            }
        }
    }

    async fn request_raw<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        quick: bool,
    ) -> Result<Bytes> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let fut = self.send(method.clone(), path, body);
        let (status, bytes) = if quick {
            tokio::time::timeout(QUICK_RPC_TIMEOUT, fut)
                .await
                .map_err(|_| {
                    CtlError::runtime(
                        RpcCode::DeadlineExceeded,
                        format!("{} {} timed out", method, path),
                    )
                })??
        } else {
            fut.await?
        };

        if (200..300).contains(&status) {
            return Ok(bytes);
        }

        let parsed: Option<ErrorBody> = serde_json::from_slice(&bytes).ok();
        let code = parsed
            .as_ref()
            .and_then(|b| b.code.as_deref())
            .map(RpcCode::from_wire)
            .unwrap_or_else(|| RpcCode::from_http(status));
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());
        Err(CtlError::runtime(code, message))
    }

    async fn request<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        quick: bool,
    ) -> Result<T> {
        let bytes = self.request_raw(method, path, body, quick).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request_empty<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        quick: bool,
    ) -> Result<()> {
        self.request_raw(method, path, body, quick).await?;
        Ok(())
    }
}

fn ns_path(ns: &str, rest: &str) -> String {
    format!("/v1/namespaces/{}{}", encode(ns), rest)
}

/// Percent-encode a path component
fn encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

const NONE: Option<&()> = None;

#[derive(Deserialize)]
struct PidResponse {
    pid: u32,
}

#[derive(Deserialize)]
struct DeleteResponse {
    exit: Option<ExitRecord>,
}

#[derive(Deserialize)]
struct PidsResponse {
    pids: Vec<u32>,
}

#[async_trait]
impl Runtime for RemoteRuntime {
    async fn create_container(&self, ns: &str, record: ContainerRecord) -> Result<ContainerRecord> {
        self.request(Method::POST, &ns_path(ns, "/containers"), Some(&record), false)
            .await
    }

    async fn load_container(&self, ns: &str, id: &str) -> Result<ContainerRecord> {
        let path = ns_path(ns, &format!("/containers/{}", encode(id)));
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn list_containers(&self, ns: &str) -> Result<Vec<ContainerRecord>> {
        self.request(Method::GET, &ns_path(ns, "/containers"), NONE, true)
            .await
    }

    async fn update_labels(
        &self,
        ns: &str,
        id: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<ContainerRecord> {
        let path = ns_path(ns, &format!("/containers/{}/labels", encode(id)));
        self.request(Method::PATCH, &path, Some(&labels), true).await
    }

    async fn update_spec(&self, ns: &str, id: &str, spec: Spec) -> Result<ContainerRecord> {
        let path = ns_path(ns, &format!("/containers/{}/spec", encode(id)));
        self.request(Method::PUT, &path, Some(&spec), true).await
    }

    async fn delete_container(&self, ns: &str, id: &str) -> Result<()> {
        let path = ns_path(ns, &format!("/containers/{}", encode(id)));
        self.request_empty(Method::DELETE, &path, NONE, false).await
    }

    async fn create_task(&self, ns: &str, id: &str, io: TaskIo) -> Result<u32> {
        let path = ns_path(ns, &format!("/tasks/{}", encode(id)));
        let response: PidResponse = self
            .request(Method::POST, &path, Some(&json!({ "io": io })), false)
            .await?;
        Ok(response.pid)
    }

    async fn start_task(&self, ns: &str, id: &str) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/start", encode(id)));
        self.request_empty(Method::POST, &path, NONE, false).await
    }

    async fn wait_task(&self, ns: &str, id: &str) -> Result<ExitRecord> {
        let path = ns_path(ns, &format!("/tasks/{}/wait", encode(id)));
        self.request(Method::POST, &path, NONE, false).await
    }

    async fn kill_task(&self, ns: &str, id: &str, signal: i32, all: bool) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/kill", encode(id)));
        let body = json!({ "signal": signal, "all": all });
        self.request_empty(Method::POST, &path, Some(&body), true)
            .await
    }

    async fn pause_task(&self, ns: &str, id: &str) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/pause", encode(id)));
        self.request_empty(Method::POST, &path, NONE, false).await
    }

    async fn resume_task(&self, ns: &str, id: &str) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/resume", encode(id)));
        self.request_empty(Method::POST, &path, NONE, false).await
    }

    async fn delete_task(&self, ns: &str, id: &str) -> Result<Option<ExitRecord>> {
        let path = ns_path(ns, &format!("/tasks/{}", encode(id)));
        let response: DeleteResponse = self.request(Method::DELETE, &path, NONE, false).await?;
        Ok(response.exit)
    }

    async fn task_status(&self, ns: &str, id: &str) -> Result<TaskInfo> {
        let path = ns_path(ns, &format!("/tasks/{}", encode(id)));
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn task_pids(&self, ns: &str, id: &str) -> Result<Vec<u32>> {
        let path = ns_path(ns, &format!("/tasks/{}/pids", encode(id)));
        let response: PidsResponse = self.request(Method::GET, &path, NONE, true).await?;
        Ok(response.pids)
    }

    async fn task_metrics(&self, ns: &str, id: &str) -> Result<TaskMetrics> {
        let path = ns_path(ns, &format!("/tasks/{}/metrics", encode(id)));
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn resize_pty(
        &self,
        ns: &str,
        id: &str,
        exec_id: Option<&str>,
        width: u16,
        height: u16,
    ) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/resize", encode(id)));
        let body = json!({ "exec_id": exec_id, "width": width, "height": height });
        self.request_empty(Method::POST, &path, Some(&body), true)
            .await
    }

    async fn close_stdin(&self, ns: &str, id: &str, exec_id: Option<&str>) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/close-stdin", encode(id)));
        let body = json!({ "exec_id": exec_id });
        self.request_empty(Method::POST, &path, Some(&body), true)
            .await
    }

    async fn exec_process(&self, ns: &str, id: &str, request: ExecRequest) -> Result<()> {
        let path = ns_path(ns, &format!("/tasks/{}/exec", encode(id)));
        self.request_empty(Method::POST, &path, Some(&request), false)
            .await
    }

    async fn start_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<u32> {
        let path = ns_path(
            ns,
            &format!("/tasks/{}/processes/{}/start", encode(id), encode(exec_id)),
        );
        let response: PidResponse = self.request(Method::POST, &path, NONE, false).await?;
        Ok(response.pid)
    }

    async fn wait_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<ExitRecord> {
        let path = ns_path(
            ns,
            &format!("/tasks/{}/processes/{}/wait", encode(id), encode(exec_id)),
        );
        self.request(Method::POST, &path, NONE, false).await
    }

    async fn kill_process(&self, ns: &str, id: &str, exec_id: &str, signal: i32) -> Result<()> {
        let path = ns_path(
            ns,
            &format!("/tasks/{}/processes/{}/kill", encode(id), encode(exec_id)),
        );
        self.request_empty(Method::POST, &path, Some(&json!({ "signal": signal })), true)
            .await
    }

    async fn delete_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<()> {
        let path = ns_path(
            ns,
            &format!("/tasks/{}/processes/{}", encode(id), encode(exec_id)),
        );
        self.request_empty(Method::DELETE, &path, NONE, false).await
    }

    async fn pull_image(&self, ns: &str, request: PullRequest) -> Result<ImageRecord> {
        self.request(Method::POST, &ns_path(ns, "/images/pull"), Some(&request), false)
            .await
    }

    async fn push_image(&self, ns: &str, request: PushRequest) -> Result<()> {
        self.request_empty(Method::POST, &ns_path(ns, "/images/push"), Some(&request), false)
            .await
    }

    async fn list_images(&self, ns: &str) -> Result<Vec<ImageRecord>> {
        self.request(Method::GET, &ns_path(ns, "/images"), NONE, true)
            .await
    }

    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord> {
        let path = ns_path(ns, &format!("/images/{}", encode(name)));
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn commit_container(&self, ns: &str, request: CommitRequest) -> Result<ImageRecord> {
        self.request(Method::POST, &ns_path(ns, "/images/commit"), Some(&request), false)
            .await
    }

    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>> {
        let path = ns_path(ns, &format!("/content/{}", encode(digest)));
        Ok(self
            .request_raw(Method::GET, &path, NONE, false)
            .await?
            .to_vec())
    }

    async fn write_content(
        &self,
        ns: &str,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<Descriptor> {
        use base64::Engine as _;
        let body = json!({
            "data": base64::engine::general_purpose::STANDARD.encode(&data),
            "labels": labels,
        });
        self.request(Method::POST, &ns_path(ns, "/content"), Some(&body), false)
            .await
    }

    async fn walk_content(&self, ns: &str) -> Result<Vec<ContentInfo>> {
        self.request(Method::GET, &ns_path(ns, "/content"), NONE, true)
            .await
    }

    async fn prepare_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        image: &str,
    ) -> Result<Vec<RootfsMount>> {
        let path = ns_path(ns, &format!("/snapshots/{}", encode(snapshotter)));
        let body = json!({ "key": key, "image": image });
        self.request(Method::POST, &path, Some(&body), false).await
    }

    async fn snapshot_mounts(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<RootfsMount>> {
        let path = ns_path(
            ns,
            &format!("/snapshots/{}/{}/mounts", encode(snapshotter), encode(key)),
        );
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn stat_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<SnapshotInfo> {
        let path = ns_path(
            ns,
            &format!("/snapshots/{}/{}", encode(snapshotter), encode(key)),
        );
        self.request(Method::GET, &path, NONE, true).await
    }

    async fn snapshot_usage(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<SnapshotUsage> {
        let path = ns_path(
            ns,
            &format!("/snapshots/{}/{}/usage", encode(snapshotter), encode(key)),
        );
        self.request(Method::GET, &path, NONE, false).await
    }

    async fn remove_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<()> {
        let path = ns_path(
            ns,
            &format!("/snapshots/{}/{}", encode(snapshotter), encode(key)),
        );
        self.request_empty(Method::DELETE, &path, NONE, false).await
    }

    async fn subscribe(&self, ns: &str) -> Result<BoxStream<'static, Result<RuntimeEvent>>> {
        let path = ns_path(ns, "/events");
        let (tx, rx) = mpsc::unbounded_channel::<Result<RuntimeEvent>>();

        match &self.transport {
            Transport::Unix(socket) => {
                let stream = UnixStream::connect(socket)
                    .await
                    .map_err(|e| self.unreachable(e))?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream))
                        .await
                        .map_err(|e| self.unreachable(format!("HTTP handshake failed: {}", e)))?;
                tokio::spawn(async move {
                    let _ = conn.await;
                });
                let request = Request::builder()
                    .method(Method::GET)
                    .uri(format!("http://localhost{}", path))
                    .header("Host", "localhost")
                    .body(Full::new(Bytes::new()))
                    .map_err(|e| CtlError::internal(format!("failed to build request: {}", e)))?;
                let response = sender
                    .send_request(request)
                    .await
                    .map_err(|e| self.unreachable(e))?;
                let mut body = response.into_body();
                tokio::spawn(async move {
                    let mut lines = LineBuffer::default();
                    while let Some(frame) = body.frame().await {
                        let Ok(frame) = frame else { break };
                        if let Some(data) = frame.data_ref() {
                            if !lines.feed(data, &tx) {
                                break;
                            }
                        }
                    }
                });
            }
            Transport::Http { client, base } => {
                let mut response = client
                    .get(format!("{}{}", base, path))
                    .send()
                    .await
                    .map_err(|e| self.unreachable(e))?;
                tokio::spawn(async move {
                    let mut lines = LineBuffer::default();
                    while let Ok(Some(chunk)) = response.chunk().await {
                        if !lines.feed(&chunk, &tx) {
                            break;
                        }
                    }
                });
            }
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Splits a chunked body into newline-delimited JSON events
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn feed(&mut self, data: &[u8], tx: &mpsc::UnboundedSender<Result<RuntimeEvent>>) -> bool {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let event = serde_json::from_slice(&line).map_err(CtlError::from);
            if tx.send(event).is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_forms() {
        assert!(matches!(
            RemoteRuntime::new("unix:///run/runectl/runtime.sock").unwrap().transport,
            Transport::Unix(_)
        ));
        assert!(matches!(
            RemoteRuntime::new("/run/runectl/runtime.sock").unwrap().transport,
            Transport::Unix(_)
        ));
        match RemoteRuntime::new("tcp://127.0.0.1:7070").unwrap().transport {
            Transport::Http { base, .. } => assert_eq!(base, "http://127.0.0.1:7070"),
            _ => panic!("expected http transport"),
        }
        assert!(RemoteRuntime::new("ftp://nope").is_err());
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode("docker.io/library/alpine:latest"), "docker.io%2Flibrary%2Falpine%3Alatest");
        assert_eq!(encode("abc-123"), "abc-123");
    }

    #[tokio::test]
    async fn test_unreachable_socket_maps_to_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = RemoteRuntime::new(temp.path().join("absent.sock").to_str().unwrap()).unwrap();
        let err = runtime.list_containers("default").await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(RpcCode::Unavailable));
    }

    #[test]
    fn test_line_buffer_splits_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut lines = LineBuffer::default();
        let event = r#"{"namespace":"default","topic":"/tasks/exit","id":"abc","timestamp":"2024-01-01T00:00:00Z"}"#;
        let (first, second) = event.split_at(20);
        assert!(lines.feed(first.as_bytes(), &tx));
        assert!(rx.try_recv().is_err());
        assert!(lines.feed(format!("{}\n", second).as_bytes(), &tx));
        let received = rx.try_recv().unwrap().unwrap();
        assert_eq!(received.topic, "/tasks/exit");
    }
}
