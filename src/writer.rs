//! Outbound batch writer.
//!
//! Debounces dirty channels and sends them as one PATCH request per
//! interval over a short-lived connection, separate from the stream. Dirty
//! flags are cleared only after a confirmed 2xx response, and only for the
//! channels captured when the body was built; anything written later stays
//! dirty for the next batch. A periodic liveness write runs on its own,
//! longer interval.

use crate::bounded::BoundedBuf;
use crate::connector::Connector;
use crate::error::{ClientError, Result};
use crate::scan::{self, CopyEnd};
use crate::session::SessionProvider;
use crate::store::{ChannelStore, PendingWrite};
use crate::transport::parse_status;
use bytes::BytesMut;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

const STATUS_LINE_MAX: usize = 128;

pub struct BatchWriter {
    host: String,
    writer_id: String,
    batch_interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_penalty: Duration,
    heartbeat_enabled: bool,
    last_batch: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl BatchWriter {
    pub fn new(
        host: impl Into<String>,
        writer_id: impl Into<String>,
        batch_interval: Duration,
        heartbeat_interval: Duration,
        heartbeat_penalty: Duration,
        heartbeat_enabled: bool,
    ) -> Self {
        Self {
            host: host.into(),
            writer_id: writer_id.into(),
            batch_interval,
            heartbeat_interval,
            heartbeat_penalty,
            heartbeat_enabled,
            last_batch: None,
            next_heartbeat: None,
        }
    }

    /// One cooperative pass: liveness write if due, then at most one channel
    /// batch if the debounce interval has elapsed and channels are dirty.
    pub async fn tick<S: SessionProvider>(
        &mut self,
        connector: &mut dyn Connector,
        session: &S,
        stream_path: &str,
        channels: &mut ChannelStore,
    ) {
        if self.heartbeat_enabled {
            self.heartbeat(connector, session, stream_path).await;
        }
        self.flush(connector, session, stream_path, channels).await;
    }

    async fn flush<S: SessionProvider>(
        &mut self,
        connector: &mut dyn Connector,
        session: &S,
        stream_path: &str,
        channels: &mut ChannelStore,
    ) {
        let due = self
            .last_batch
            .map_or(true, |t| t.elapsed() >= self.batch_interval);
        if !due || channels.dirty_count() == 0 {
            return;
        }

        let snapshot = channels.snapshot_dirty();
        debug!(channels = snapshot.len(), "sending channel batch");

        let sent = match build_batch_body(&snapshot, &self.writer_id) {
            Ok(body) => self.send_patch(connector, session, stream_path, &body).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                channels.confirm_sent(&snapshot);
                debug!(channels = snapshot.len(), "batch confirmed");
            }
            Err(e) => {
                // Dirty flags stay set; the same channels are re-polled on
                // the next interval.
                warn!(error = %e, "batch write failed, retrying next interval");
            }
        }
        self.last_batch = Some(Instant::now());
    }

    async fn heartbeat<S: SessionProvider>(
        &mut self,
        connector: &mut dyn Connector,
        session: &S,
        stream_path: &str,
    ) {
        let due = self.next_heartbeat.map_or(true, |t| Instant::now() >= t);
        if !due {
            return;
        }

        let path = heartbeat_path(stream_path);
        let beat = Heartbeat {
            last_seen: Utc::now().timestamp(),
        };
        let sent = match serde_json::to_string(&beat) {
            Ok(body) => self.send_patch(connector, session, &path, &body).await,
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => {
                self.next_heartbeat = Some(Instant::now() + self.heartbeat_interval);
            }
            Err(e) => {
                warn!(error = %e, "heartbeat write failed, retrying shortly");
                self.next_heartbeat = Some(Instant::now() + self.heartbeat_penalty);
            }
        }
    }

    /// One short-lived PATCH exchange: connect, send, read the status line,
    /// drop the connection.
    async fn send_patch<S: SessionProvider>(
        &self,
        connector: &mut dyn Connector,
        session: &S,
        path: &str,
        body: &str,
    ) -> Result<()> {
        let mut socket = connector.connect(&self.host).await.map_err(|e| {
            ClientError::Transport(format!("connect to {} failed: {e}", self.host))
        })?;
        let request = build_patch_request(&self.host, path, session.credential(), body);
        socket.write_all(&request).await?;

        let mut reader = BufReader::new(socket);
        let mut line = BoundedBuf::new(STATUS_LINE_MAX);
        if scan::read_line(&mut reader, &mut line).await? != CopyEnd::Terminator {
            return Err(ClientError::Transport(
                "write response missing status line".to_string(),
            ));
        }
        let status = parse_status(line.as_str().unwrap_or(""))?;
        if !(200..300).contains(&status) {
            return Err(ClientError::Transport(format!(
                "write rejected with status {status}"
            )));
        }
        Ok(())
    }
}

/// Wire encoding of one outbound channel value: data plus writer tag.
#[derive(Serialize)]
struct WireValue<'a> {
    d: &'a str,
    w: &'a str,
}

#[derive(Serialize)]
struct Heartbeat {
    last_seen: i64,
}

/// `{"CH{i}":{"d":"<value>","w":"<writer>"}}` for every captured channel.
fn build_batch_body(snapshot: &[PendingWrite], writer_id: &str) -> Result<String> {
    let entries: BTreeMap<String, WireValue<'_>> = snapshot
        .iter()
        .map(|write| {
            (
                format!("CH{}", write.index),
                WireValue {
                    d: &write.value,
                    w: writer_id,
                },
            )
        })
        .collect();
    Ok(serde_json::to_string(&entries)?)
}

/// Liveness writes target the parent of the properties path.
fn heartbeat_path(stream_path: &str) -> String {
    match stream_path.rfind('/') {
        Some(i) if i > 0 => format!("{}.json", &stream_path[..i]),
        _ => stream_path.to_string(),
    }
}

fn build_patch_request(host: &str, path: &str, credential: Option<&str>, body: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.extend_from_slice(b"PATCH ");
    buf.extend_from_slice(path.as_bytes());
    match credential {
        Some(token) => {
            buf.extend_from_slice(b"?auth=");
            buf.extend_from_slice(token.as_bytes());
            buf.extend_from_slice(b"&print=silent");
        }
        None => buf.extend_from_slice(b"?print=silent"),
    }
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(b"Content-Type: application/json\r\n");
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body.as_bytes());
    buf
}
