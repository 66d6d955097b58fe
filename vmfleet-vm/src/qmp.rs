//! QMP client for controlling a running hypervisor
//!
//! QMP is newline-delimited JSON over a unix socket. The server greets,
//! the client negotiates capabilities, and each command gets exactly one
//! `return` or `error` reply. Asynchronous `event` messages may arrive in
//! between and are skipped.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use vmfleet_core::{FleetError, FleetResult};

/// An established QMP session
#[async_trait]
pub trait QmpChannel: Send + Sync {
    /// Runs a command and returns its `return` value
    async fn execute(&self, command: &str, arguments: Option<Value>) -> FleetResult<Value>;

    /// Sends operator-supplied JSON verbatim and returns the reply text
    async fn raw(&self, json: &str) -> FleetResult<String>;
}

/// Opens QMP sessions to a socket path
#[async_trait]
pub trait QmpConnector: Send + Sync {
    async fn connect(&self, socket: &Path) -> FleetResult<Arc<dyn QmpChannel>>;
}

#[derive(Serialize)]
struct QmpRequest<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

fn qmp_error(details: impl Into<String>) -> FleetError {
    FleetError::operation_failed("qmp", details)
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn send(&mut self, line: &str) -> FleetResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next non-event message
    async fn reply(&mut self) -> FleetResult<Value> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(qmp_error("connection closed"));
            }
            let message: Value = serde_json::from_str(line.trim())?;
            if message.get("event").is_some() {
                debug!("qmp event: {}", message["event"]);
                continue;
            }
            return Ok(message);
        }
    }
}

/// QMP over a unix socket
pub struct UnixQmp {
    session: Mutex<Session>,
}

impl UnixQmp {
    /// Connects and negotiates capabilities
    pub async fn connect(socket: &Path) -> FleetResult<Self> {
        let stream = UnixStream::connect(socket).await?;
        let (read, write) = stream.into_split();
        let mut session = Session {
            reader: BufReader::new(read),
            writer: write,
        };

        let greeting = session.reply().await?;
        if greeting.get("QMP").is_none() {
            return Err(qmp_error(format!("unexpected greeting: {}", greeting)));
        }

        let qmp = Self {
            session: Mutex::new(session),
        };
        qmp.execute("qmp_capabilities", None).await?;
        Ok(qmp)
    }
}

#[async_trait]
impl QmpChannel for UnixQmp {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> FleetResult<Value> {
        let request = serde_json::to_string(&QmpRequest {
            execute: command,
            arguments,
        })?;

        let mut session = self.session.lock().await;
        session.send(&request).await?;
        let reply = session.reply().await?;

        if let Some(ret) = reply.get("return") {
            return Ok(ret.clone());
        }
        let desc = reply
            .pointer("/error/desc")
            .and_then(Value::as_str)
            .unwrap_or("malformed reply");
        Err(qmp_error(format!("{}: {}", command, desc)))
    }

    async fn raw(&self, json: &str) -> FleetResult<String> {
        let parsed: Value = serde_json::from_str(json)
            .map_err(|e| FleetError::invalid_input("qmp", e.to_string()))?;

        let mut session = self.session.lock().await;
        session.send(&parsed.to_string()).await?;
        Ok(session.reply().await?.to_string())
    }
}

/// Connects to a freshly spawned hypervisor, retrying while its socket
/// appears
pub struct UnixQmpConnector {
    retries: u32,
    delay: Duration,
}

impl UnixQmpConnector {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

#[async_trait]
impl QmpConnector for UnixQmpConnector {
    async fn connect(&self, socket: &Path) -> FleetResult<Arc<dyn QmpChannel>> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            match UnixQmp::connect(socket).await {
                Ok(qmp) => return Ok(Arc::new(qmp)),
                Err(e) => {
                    debug!("qmp connect attempt {} to {}: {}", attempt, socket.display(), e);
                    last_error = Some(e);
                    tokio::time::sleep(self.delay).await;
                }
            }
        }

        warn!("giving up on qmp socket {}", socket.display());
        Err(qmp_error(format!(
            "could not connect to {}: {}",
            socket.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Lazily connected QMP handle owned by one VM
pub struct LazyQmp {
    socket: PathBuf,
    connector: Arc<dyn QmpConnector>,
    channel: Mutex<Option<Arc<dyn QmpChannel>>>,
}

impl LazyQmp {
    pub fn new(socket: PathBuf, connector: Arc<dyn QmpConnector>) -> Self {
        Self {
            socket,
            connector,
            channel: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn channel(&self) -> FleetResult<Arc<dyn QmpChannel>> {
        let mut channel = self.channel.lock().await;
        if let Some(existing) = channel.as_ref() {
            return Ok(existing.clone());
        }
        let connected = self.connector.connect(&self.socket).await?;
        *channel = Some(connected.clone());
        Ok(connected)
    }

    /// Drops the session so the next call reconnects
    pub async fn reset(&self) {
        self.channel.lock().await.take();
    }

    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> FleetResult<Value> {
        self.channel().await?.execute(command, arguments).await
    }

    /// Runs a human monitor command and returns its text output
    pub async fn hmp(&self, command_line: &str) -> FleetResult<String> {
        let output = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": command_line })),
            )
            .await?;
        Ok(output.as_str().unwrap_or_default().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Minimal QMP server: greets, then answers each request once
    async fn serve(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        while let Some(line) = lines.next_line().await.unwrap() {
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = match request["execute"].as_str().unwrap() {
                "qmp_capabilities" => json!({ "return": {} }),
                "query-status" => {
                    write
                        .write_all(b"{\"event\": \"RESUME\", \"data\": {}}\n")
                        .await
                        .unwrap();
                    json!({ "return": { "status": "running" } })
                }
                other => json!({ "error": { "class": "CommandNotFound", "desc": format!("no {}", other) } }),
            };
            write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unix_qmp_session() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("qmp");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener));

        let qmp = UnixQmp::connect(&socket).await.unwrap();

        let status = qmp.execute("query-status", None).await.unwrap();
        assert_eq!(status["status"], "running");

        let err = qmp.execute("bogus", None).await.unwrap_err();
        assert!(err.to_string().contains("no bogus"));

        let raw = qmp.raw(r#"{"execute": "query-status"}"#).await.unwrap();
        assert!(raw.contains("running"));
        assert!(qmp.raw("not json").await.unwrap_err().is_malformed_input());
    }

    #[tokio::test]
    async fn test_connector_gives_up() {
        let dir = TempDir::new().unwrap();
        let connector = UnixQmpConnector::new(2, Duration::from_millis(1));
        let err = connector
            .connect(&dir.path().join("missing"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("could not connect"));
    }
}
