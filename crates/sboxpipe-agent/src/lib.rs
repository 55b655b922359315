//! Best-effort IPC client for the sboxagent supervisor process.
//!
//! The wire protocol is framed JSON over a Unix stream socket: a 4-byte
//! big-endian payload length, a 4-byte big-endian protocol version, then
//! the JSON payload. Payloads are one of four envelopes: `event`,
//! `command`, `response`, `heartbeat`.
//!
//! The agent is an optional collaborator. Every failure here downgrades to
//! "agent unavailable"; the pipeline never depends on it for correctness
//! and never blocks longer than the configured timeout.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use sboxpipe_events::trace;
use sboxpipe_types::Event;

/// Current framed-JSON protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default supervisor socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sboxagent.sock";

/// Default socket timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single frame payload. Anything larger is treated as a
/// corrupt stream.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Socket missing, refused, or closed; the agent is simply not there.
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => AgentError::Timeout,
            _ => AgentError::Unavailable(err.to_string()),
        }
    }
}

/// Commands the client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCommand {
    Ping,
    Validate,
    Install,
    Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub source: String,
    pub priority: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: AgentCommand,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: ResponseStatus,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub status: String,
    pub version: String,
}

/// One framed payload. The serde tag matches the wire `type` field and the
/// variant carries its same-named envelope object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Event {
        id: String,
        timestamp: DateTime<Utc>,
        event: EventPayload,
    },
    Command {
        id: String,
        timestamp: DateTime<Utc>,
        command: CommandPayload,
    },
    Response {
        id: String,
        timestamp: DateTime<Utc>,
        response: ResponsePayload,
    },
    Heartbeat {
        id: String,
        timestamp: DateTime<Utc>,
        heartbeat: HeartbeatPayload,
    },
}

impl AgentMessage {
    pub fn command(command: AgentCommand, params: BTreeMap<String, Value>) -> Self {
        AgentMessage::Command {
            id: trace::short_token(),
            timestamp: Utc::now(),
            command: CommandPayload { command, params },
        }
    }

    pub fn event(event: &Event) -> Self {
        AgentMessage::Event {
            id: trace::short_token(),
            timestamp: Utc::now(),
            event: EventPayload {
                event_type: event.event_type.clone(),
                source: event.source.clone(),
                priority: serde_json::to_value(event.priority)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "normal".to_string()),
                data: event.data.clone(),
            },
        }
    }

    pub fn heartbeat(agent_id: &str, status: &str) -> Self {
        AgentMessage::Heartbeat {
            id: trace::short_token(),
            timestamp: Utc::now(),
            heartbeat: HeartbeatPayload {
                agent_id: agent_id.to_string(),
                status: status.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            AgentMessage::Event { id, .. }
            | AgentMessage::Command { id, .. }
            | AgentMessage::Response { id, .. }
            | AgentMessage::Heartbeat { id, .. } => id,
        }
    }
}

/// Encode one payload as a wire frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read one frame payload from the stream.
///
/// Partial frames surface as I/O errors (and are discarded by the caller);
/// an oversize length or unknown version is a protocol error.
pub fn read_frame(reader: &mut impl Read) -> Result<Vec<u8>, AgentError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if version != PROTOCOL_VERSION {
        return Err(AgentError::Protocol(format!(
            "unsupported protocol version: {version}"
        )));
    }
    if len > MAX_FRAME_LEN {
        return Err(AgentError::Protocol(format!(
            "frame length {len} exceeds cap {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Encode a message as a complete frame.
pub fn encode_message(message: &AgentMessage) -> Result<Vec<u8>, AgentError> {
    let payload = serde_json::to_vec(message)?;
    Ok(encode_frame(&payload))
}

/// Decode one message from a frame payload.
pub fn decode_message(payload: &[u8]) -> Result<AgentMessage, AgentError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(unix)]
mod client {
    use std::os::unix::net::UnixStream;

    use super::*;

    /// Blocking client for the supervisor socket.
    ///
    /// Connections are opened lazily per call; a caller owns one client at
    /// a time. All operations observe the configured timeout.
    #[derive(Debug, Clone)]
    pub struct AgentClient {
        socket_path: PathBuf,
        timeout: Duration,
    }

    impl Default for AgentClient {
        fn default() -> Self {
            Self::new(PathBuf::from(DEFAULT_SOCKET_PATH), DEFAULT_TIMEOUT)
        }
    }

    impl AgentClient {
        pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
            Self {
                socket_path,
                timeout,
            }
        }

        pub fn socket_path(&self) -> &Path {
            &self.socket_path
        }

        fn connect(&self) -> Result<UnixStream, AgentError> {
            let stream = UnixStream::connect(&self.socket_path)?;
            stream.set_read_timeout(Some(self.timeout))?;
            stream.set_write_timeout(Some(self.timeout))?;
            Ok(stream)
        }

        /// True when the agent answers a ping within the timeout.
        pub fn ping(&self) -> bool {
            self.send_command(AgentCommand::Ping, BTreeMap::new())
                .map(|r| r.status == ResponseStatus::Success)
                .unwrap_or(false)
        }

        /// Ask the agent to validate a generated configuration.
        pub fn validate(
            &self,
            config_path: &Path,
            client_type: Option<&str>,
            strict: bool,
        ) -> Result<ResponsePayload, AgentError> {
            let mut params = BTreeMap::new();
            params.insert(
                "config_path".to_string(),
                Value::from(config_path.display().to_string()),
            );
            if let Some(client_type) = client_type {
                params.insert("client_type".to_string(), Value::from(client_type));
            }
            params.insert("strict".to_string(), Value::from(strict));
            self.send_command(AgentCommand::Validate, params)
        }

        pub fn install(
            &self,
            client_type: &str,
            version: &str,
            force: bool,
        ) -> Result<ResponsePayload, AgentError> {
            let mut params = BTreeMap::new();
            params.insert("client_type".to_string(), Value::from(client_type));
            params.insert("version".to_string(), Value::from(version));
            params.insert("force".to_string(), Value::from(force));
            self.send_command(AgentCommand::Install, params)
        }

        pub fn check(&self, client_type: Option<&str>) -> Result<ResponsePayload, AgentError> {
            let mut params = BTreeMap::new();
            if let Some(client_type) = client_type {
                params.insert("client_type".to_string(), Value::from(client_type));
            }
            self.send_command(AgentCommand::Check, params)
        }

        /// Send a command and wait for the matching response. Interleaved
        /// event and heartbeat frames from the agent are skipped; malformed
        /// payloads are discarded.
        pub fn send_command(
            &self,
            command: AgentCommand,
            params: BTreeMap<String, Value>,
        ) -> Result<ResponsePayload, AgentError> {
            let message = AgentMessage::command(command, params);
            let request_id = message.id().to_string();

            let mut stream = self.connect()?;
            stream.write_all(&encode_message(&message)?)?;
            stream.flush()?;

            loop {
                let payload = read_frame(&mut stream)?;
                let reply = match decode_message(&payload) {
                    Ok(reply) => reply,
                    Err(AgentError::Json(_)) => continue,
                    Err(other) => return Err(other),
                };
                if let AgentMessage::Response { response, .. } = reply {
                    if response.request_id == request_id {
                        return Ok(response);
                    }
                }
            }
        }

        /// Fire-and-forget event publication. No response is awaited.
        pub fn send_event(&self, event: &Event) -> Result<(), AgentError> {
            let mut stream = self.connect()?;
            stream.write_all(&encode_message(&AgentMessage::event(event))?)?;
            stream.flush()?;
            Ok(())
        }

        /// Start a background heartbeat loop. The loop stops when the
        /// returned handle is dropped; delivery failures are ignored.
        pub fn spawn_heartbeat(&self, agent_id: String, interval: Duration) -> HeartbeatHandle {
            let stop = Arc::new(AtomicBool::new(false));
            let stop2 = Arc::clone(&stop);
            let client = self.clone();

            let join = std::thread::spawn(move || {
                while !stop2.load(Ordering::SeqCst) {
                    let beat = AgentMessage::heartbeat(&agent_id, "running");
                    if let Ok(mut stream) = client.connect() {
                        if let Ok(frame) = encode_message(&beat) {
                            let _ = stream.write_all(&frame);
                        }
                    }
                    // Wake early on stop rather than sleeping the full interval.
                    let step = Duration::from_millis(100);
                    let mut waited = Duration::ZERO;
                    while waited < interval && !stop2.load(Ordering::SeqCst) {
                        std::thread::sleep(step.min(interval - waited));
                        waited += step;
                    }
                }
            });

            HeartbeatHandle {
                stop,
                join: Some(join),
            }
        }
    }

    /// Stops the heartbeat loop on drop.
    #[derive(Debug)]
    pub struct HeartbeatHandle {
        stop: Arc<AtomicBool>,
        join: Option<JoinHandle<()>>,
    }

    impl Drop for HeartbeatHandle {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(unix)]
pub use client::{AgentClient, HeartbeatHandle};
