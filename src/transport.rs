//! Persistent streaming transport.
//!
//! Owns the long-lived stream socket and its connect/redirect/reconnect
//! state machine: `Disconnected -> Connecting -> Streaming -> Disconnected`,
//! no other cycle. Failures never propagate past this module; everything
//! degrades to `Disconnected` and a backoff-timed retry on a later tick.
//!
//! While streaming, bytes are drained inside a short poll window so a tick
//! returns promptly when the line is idle. Once a `data:` marker completes,
//! the dispatcher reads the rest of that update directly off the socket
//! (an update that straddles packets blocks until its bytes arrive, like
//! the connect handshake).

use crate::bounded::BoundedBuf;
use crate::connector::{Connector, StreamSocket};
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::scan::{self, CopyEnd};
use crate::session::SessionProvider;
use bytes::BytesMut;
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const EVENT_MARKER: &[u8] = b"event:";
const DATA_MARKER: &[u8] = b"data:";

/// Server-sent event names that invalidate the session: the stream is torn
/// down immediately and not resumed until a reconnect succeeds.
const CANCEL_EVENT: &str = "cancel";
const AUTH_REVOKED_EVENT: &str = "auth_revoked";

const EVENT_NAME_MAX: usize = 64;
const STATUS_LINE_MAX: usize = 128;
const LOCATION_MAX: usize = 256;
const MAX_HEADER_LINES: usize = 64;

/// How long one streaming tick waits for further queued bytes before
/// yielding back to the driver loop.
const POLL_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Streaming,
}

pub struct StreamTransport {
    host: String,
    path: String,
    started: bool,
    uid_substituted: bool,
    state: SocketState,
    socket: Option<BufReader<Box<dyn StreamSocket>>>,
    last_connection_attempt: Option<Instant>,
    last_update: Option<Instant>,
    update_interval: Duration,
    reconnect_backoff: Duration,
    max_redirects: usize,
    // Rolling SSE marker matches, persisted across ticks so a marker split
    // over two reads still completes.
    event_progress: usize,
    data_progress: usize,
}

impl StreamTransport {
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        update_interval: Duration,
        reconnect_backoff: Duration,
        max_redirects: usize,
    ) -> Self {
        let mut path = path.into();
        if !path.ends_with(".json") {
            path.push_str(".json");
        }
        Self {
            host: host.into(),
            path,
            started: false,
            uid_substituted: false,
            state: SocketState::Disconnected,
            socket: None,
            last_connection_attempt: None,
            last_update: None,
            update_interval,
            reconnect_backoff,
            max_redirects,
            event_progress: 0,
            data_progress: 0,
        }
    }

    /// Mark the transport eligible to connect. Does not connect
    /// synchronously; idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.last_connection_attempt = None;
    }

    /// Tear down the socket and return to `Disconnected`. Idempotent, safe
    /// at any time.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.set_disconnected();
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SocketState::Streaming
    }

    /// Subscribe path, after any `$uid` substitution so far.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the session identity has been folded into the path. Outbound
    /// requests must not go out against a template path.
    pub fn identity_resolved(&self) -> bool {
        self.uid_substituted
    }

    /// One cooperative pass: substitute the session identity into the path
    /// the first time it becomes available, drain queued stream bytes when
    /// streaming, or attempt a (re)connect when the backoff has elapsed.
    pub async fn tick<S: SessionProvider>(
        &mut self,
        connector: &mut dyn Connector,
        session: &S,
        dispatcher: &mut Dispatcher<'_>,
    ) {
        if !self.started || !session.ready() {
            return;
        }

        if !self.uid_substituted {
            if let Some(uid) = session.user_uid() {
                if self.path.contains("$uid") {
                    self.path = self.path.replace("$uid", uid);
                }
                self.uid_substituted = true;
            }
            return;
        }

        match self.state {
            SocketState::Streaming => {
                let due = self
                    .last_update
                    .map_or(true, |t| t.elapsed() >= self.update_interval);
                if due {
                    self.handle_update(dispatcher).await;
                    self.last_update = Some(Instant::now());
                }
            }
            _ => {
                let due = self
                    .last_connection_attempt
                    .map_or(true, |t| t.elapsed() >= self.reconnect_backoff);
                if due {
                    debug!(path = %self.path, "stream disconnected, trying to connect");
                    match self.connect(connector, session).await {
                        Ok(()) => {
                            info!(host = %self.host, "stream connected");
                            dispatcher.channels.note_reconnected();
                        }
                        Err(e) => {
                            warn!(error = %e, "stream connect failed, retrying after backoff");
                            self.set_disconnected();
                        }
                    }
                    self.last_connection_attempt = Some(Instant::now());
                }
            }
        }
    }

    /// Open the stream: GET with `Accept: text/event-stream`, following up
    /// to `max_redirects` HTTPS redirects, validating the status line.
    async fn connect<S: SessionProvider>(
        &mut self,
        connector: &mut dyn Connector,
        session: &S,
    ) -> Result<()> {
        self.state = SocketState::Connecting;
        let mut host = self.host.clone();
        let mut path = self.path.clone();

        for _ in 0..=self.max_redirects {
            let mut socket = connector
                .connect(&host)
                .await
                .map_err(|e| ClientError::Transport(format!("connect to {host} failed: {e}")))?;
            let request = build_stream_request(&host, &path, session.credential());
            socket.write_all(&request).await?;

            let mut reader = BufReader::new(socket);
            let mut line = BoundedBuf::new(STATUS_LINE_MAX);
            if scan::read_line(&mut reader, &mut line).await? != CopyEnd::Terminator {
                return Err(ClientError::Transport("missing status line".to_string()));
            }
            let status = parse_status(line.as_str().unwrap_or(""))?;

            // Read header lines up to the blank separator, remembering a
            // `location:` header (case-insensitively) in case this is a
            // redirect. The body after the separator is the event stream.
            let mut location: Option<String> = None;
            let mut header = BoundedBuf::new(LOCATION_MAX);
            for _ in 0..MAX_HEADER_LINES {
                header.clear();
                match scan::read_line(&mut reader, &mut header).await? {
                    CopyEnd::Eof => {
                        return Err(ClientError::Transport(
                            "stream closed before headers ended".to_string(),
                        ))
                    }
                    CopyEnd::Capacity => {
                        // Oversized header; drop its tail and keep the
                        // bounded prefix for the location check.
                        if !scan::find(&mut reader, "\n", false).await? {
                            return Err(ClientError::Transport(
                                "stream closed inside header".to_string(),
                            ));
                        }
                    }
                    CopyEnd::Terminator => {}
                }
                if header.is_empty() {
                    break;
                }
                let text = header.as_str().unwrap_or("");
                if location.is_none() {
                    if let Some(rest) = strip_prefix_ci(text, "location:") {
                        location = Some(rest.trim().to_string());
                    }
                }
            }

            if (300..400).contains(&status) {
                let target = location.ok_or_else(|| {
                    ClientError::Transport(format!(
                        "redirect status {status} without location header"
                    ))
                })?;
                let rest = target.strip_prefix("https://").ok_or_else(|| {
                    ClientError::Transport(format!("redirect target is not https: {target}"))
                })?;
                (host, path) = match rest.split_once('/') {
                    Some((h, p)) => (h.to_string(), format!("/{p}")),
                    None => (rest.to_string(), "/".to_string()),
                };
                debug!(host = %host, path = %path, "following stream redirect");
                continue;
            }

            if !(200..300).contains(&status) {
                return Err(ClientError::Transport(format!(
                    "stream connect returned status {status}"
                )));
            }

            self.socket = Some(reader);
            self.state = SocketState::Streaming;
            self.event_progress = 0;
            self.data_progress = 0;
            self.last_update = None;
            return Ok(());
        }

        Err(ClientError::Transport(format!(
            "redirect limit of {} exceeded",
            self.max_redirects
        )))
    }

    /// Drain queued stream bytes, tracking `event:` and `data:` markers.
    async fn handle_update(&mut self, dispatcher: &mut Dispatcher<'_>) {
        let Some(mut reader) = self.socket.take() else {
            self.set_disconnected();
            return;
        };

        loop {
            let b = match timeout(POLL_WINDOW, scan::read_byte(&mut reader)).await {
                // No further bytes queued; yield back to the driver.
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "stream read failed, disconnecting");
                    self.set_disconnected();
                    return;
                }
                Ok(Ok(None)) => {
                    debug!("stream closed by server");
                    self.set_disconnected();
                    return;
                }
                Ok(Ok(Some(b))) => b,
            };
            let c = b.to_ascii_lowercase();

            if c == EVENT_MARKER[self.event_progress] {
                self.event_progress += 1;
            } else {
                self.event_progress = 0;
            }
            if self.event_progress == EVENT_MARKER.len() {
                self.event_progress = 0;
                let mut name = BoundedBuf::new(EVENT_NAME_MAX);
                if scan::read_line(&mut reader, &mut name).await.is_err() {
                    self.set_disconnected();
                    return;
                }
                let name = name.as_str().unwrap_or("").trim_start();
                debug!(event = name, "stream event");
                if name == CANCEL_EVENT || name == AUTH_REVOKED_EVENT {
                    info!(event = name, "session revoked by server, disconnecting stream");
                    self.set_disconnected();
                    return;
                }
                continue;
            }

            if c == DATA_MARKER[self.data_progress] {
                self.data_progress += 1;
            } else {
                self.data_progress = 0;
            }
            if self.data_progress == DATA_MARKER.len() {
                self.data_progress = 0;
                match dispatcher.dispatch(&mut reader, Utc::now()).await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "stream update failed mid-parse, disconnecting");
                        self.set_disconnected();
                        return;
                    }
                }
            }
        }

        self.socket = Some(reader);
    }

    fn set_disconnected(&mut self) {
        self.socket = None;
        self.state = SocketState::Disconnected;
        self.event_progress = 0;
        self.data_progress = 0;
    }
}

fn build_stream_request(host: &str, path: &str, credential: Option<&str>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(b"GET ");
    buf.extend_from_slice(path.as_bytes());
    if let Some(token) = credential {
        buf.extend_from_slice(b"?auth=");
        buf.extend_from_slice(token.as_bytes());
    }
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(b"Accept: text/event-stream\r\n");
    buf.extend_from_slice(b"Connection: keep-alive\r\n");
    buf.extend_from_slice(b"\r\n");
    buf
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

pub(crate) fn parse_status(line: &str) -> Result<u16> {
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::Transport(format!("malformed status line: {line:?}")))
}
