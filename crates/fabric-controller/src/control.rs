use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::daemon::ControlMsg;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{HostId, InstanceId};
use crate::orchestrator::AllocateRequest;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u8,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, cmd: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: id.into(),
            cmd: cmd.into(),
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl ControlError {
    fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: "invalid_request".into(),
            message: msg.into(),
        }
    }

    fn unknown_method() -> Self {
        Self {
            code: "unknown_method".into(),
            message: "unknown command".into(),
        }
    }

    fn decode(msg: impl Into<String>) -> Self {
        Self {
            code: "decode_error".into(),
            message: msg.into(),
        }
    }

    fn daemon_gone() -> Self {
        Self {
            code: "daemon_unavailable".into(),
            message: "daemon stopped before answering".into(),
        }
    }
}

impl From<OrchestratorError> for ControlError {
    fn from(err: OrchestratorError) -> Self {
        Self {
            code: err.kind().as_str().into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstancePayload {
    instance: u64,
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    instance: u64,
    #[serde(default)]
    host: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StopPayload {
    instance: u64,
    #[serde(default)]
    forced: bool,
}

#[derive(Debug, Deserialize)]
struct HostPayload {
    instance: u64,
    host: u64,
}

#[derive(Debug, Deserialize)]
struct NicPayload {
    instance: u64,
    network: u64,
}

/// Control server (Unix socket, NDJSON framing) that translates requests
/// into daemon control messages and waits for their answers.
pub struct ControlServer {
    path: PathBuf,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlServer {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        control_tx: mpsc::Sender<ControlMsg>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown_rx = shutdown_tx.subscribe();
        Self {
            path: path.into(),
            control_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }

        let listener = UnixListener::bind(&self.path)?;
        // Owner-only, best-effort.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        debug!(path = %self.path.display(), "control socket listening");

        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let tx = self.control_tx.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(handle_conn(stream, tx, shutdown_tx));
                        }
                        Err(err) => warn!(error = %err, "control accept failed"),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    let _ = std::fs::remove_file(&self.path);
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_conn(
    stream: UnixStream,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut line = String::new();

    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break;
        }
        let resp = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => handle_request(req, &control_tx, &shutdown_tx).await,
            Err(e) => ResponseEnvelope {
                id: "".into(),
                ok: false,
                result: None,
                error: Some(ControlError::decode(e.to_string())),
            },
        };
        if let Ok(json) = serde_json::to_string(&resp) {
            let _ = w.write_all(json.as_bytes()).await;
            let _ = w.write_all(b"\n").await;
        }
        line.clear();
    }
}

fn payload<T: DeserializeOwned>(req: &RequestEnvelope) -> Result<T, ControlError> {
    serde_json::from_value(req.payload.clone()).map_err(|e| ControlError::decode(e.to_string()))
}

/// Send one message built around a fresh reply channel and await the answer.
async fn call<T>(
    control_tx: &mpsc::Sender<ControlMsg>,
    build: impl FnOnce(oneshot::Sender<OrchestratorResult<T>>) -> ControlMsg,
) -> Result<T, ControlError> {
    let (tx, rx) = oneshot::channel();
    control_tx
        .send(build(tx))
        .await
        .map_err(|_| ControlError::daemon_gone())?;
    let inner = rx.await.map_err(|_| ControlError::daemon_gone())?;
    inner.map_err(ControlError::from)
}

async fn handle_request(
    req: RequestEnvelope,
    control_tx: &mpsc::Sender<ControlMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) -> ResponseEnvelope {
    let id = req.id.clone();
    let res = dispatch(&req, control_tx, shutdown_tx).await;
    match res {
        Ok(result) => ResponseEnvelope {
            id,
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(err) => ResponseEnvelope {
            id,
            ok: false,
            result: None,
            error: Some(err),
        },
    }
}

async fn dispatch(
    req: &RequestEnvelope,
    control_tx: &mpsc::Sender<ControlMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<serde_json::Value, ControlError> {
    if req.v != PROTOCOL_VERSION {
        return Err(ControlError::invalid_request(
            "unsupported protocol version",
        ));
    }
    match req.cmd.as_str() {
        "allocate" => {
            let request: AllocateRequest = payload(req)?;
            let id = call(control_tx, |resp| ControlMsg::Allocate { request, resp }).await?;
            Ok(json!({ "instance": id }))
        }
        "start" => {
            let p: StartPayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Start {
                instance: InstanceId(p.instance),
                host: p.host.map(HostId),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "stop" => {
            let p: StopPayload = payload(req)?;
            let stopped = call(control_tx, |resp| ControlMsg::Stop {
                instance: InstanceId(p.instance),
                forced: p.forced,
                resp,
            })
            .await?;
            Ok(json!({ "stopped": stopped }))
        }
        "reboot" => {
            let p: InstancePayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Reboot {
                instance: InstanceId(p.instance),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "migrate" => {
            let p: HostPayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Migrate {
                instance: InstanceId(p.instance),
                destination: HostId(p.host),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "migrate-away" => {
            let p: HostPayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::MigrateAway {
                instance: InstanceId(p.instance),
                source: HostId(p.host),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "destroy" => {
            let p: InstancePayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Destroy {
                instance: InstanceId(p.instance),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "expunge" => {
            let p: InstancePayload = payload(req)?;
            let expunged = call(control_tx, |resp| ControlMsg::Expunge {
                instance: InstanceId(p.instance),
                resp,
            })
            .await?;
            Ok(json!({ "expunged": expunged }))
        }
        "recover" => {
            let p: InstancePayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Recover {
                instance: InstanceId(p.instance),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "add-nic" => {
            let p: NicPayload = payload(req)?;
            let nic = call(control_tx, |resp| ControlMsg::AddNic {
                instance: InstanceId(p.instance),
                network: p.network,
                resp,
            })
            .await?;
            Ok(json!({ "nic": nic }))
        }
        "remove-nic" => {
            let p: NicPayload = payload(req)?;
            let removed = call(control_tx, |resp| ControlMsg::RemoveNic {
                instance: InstanceId(p.instance),
                network: p.network,
                resp,
            })
            .await?;
            Ok(json!({ "removed": removed }))
        }
        "show" => {
            let p: InstancePayload = payload(req)?;
            let vm = call(control_tx, |resp| ControlMsg::Show {
                instance: InstanceId(p.instance),
                resp,
            })
            .await?;
            Ok(json!({ "instance": vm }))
        }
        "shutdown" => {
            call(control_tx, |resp| ControlMsg::Shutdown {
                resp,
                shutdown_tx: shutdown_tx.clone(),
            })
            .await?;
            Ok(json!({}))
        }
        _ => Err(ControlError::unknown_method()),
    }
}

pub struct ControlClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        let reader = BufReader::new(r);
        Ok(Self { reader, writer: w })
    }

    pub async fn request(
        &mut self,
        envelope: &RequestEnvelope,
    ) -> std::io::Result<ResponseEnvelope> {
        let json = serde_json::to_string(envelope).map_err(std::io::Error::other)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control socket closed",
            ));
        }
        serde_json::from_str(&line).map_err(std::io::Error::other)
    }
}
