//! Client configuration.
//!
//! Capacities here size the channel and schedule arenas once, at startup.
//! Nothing is resized afterwards.

use crate::error::{ClientError, Result};
use std::time::Duration;

/// Wire paths encode channel/schedule ids as at most two decimal digits.
pub const MAX_CHANNELS: usize = 99;
pub const MAX_SCHEDULES: usize = 99;

/// Writer ids ride along with every outbound value.
pub const MAX_WRITER_ID_LEN: usize = 8;

/// Subscribe path template. `$uid` is substituted once a session identity
/// becomes available.
pub const STREAM_PATH_PREFIX: &str = "/users/$uid/devices/";
pub const STREAM_PATH_SUFFIX: &str = "properties";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote host, without protocol or trailing slashes,
    /// e.g. `my-db.example.com`.
    pub host: String,

    /// Device identifier, as registered with the backend.
    pub device_id: String,

    /// Identity tag attached to every value this device writes. Remote
    /// echoes carrying this id are suppressed.
    pub writer_id: String,

    /// Number of channels (fixed; each channel costs one table slot).
    pub channel_count: usize,

    /// Schedule job table capacity.
    pub schedule_capacity: usize,

    /// Maximum channel value size in bytes.
    pub max_value_len: usize,

    /// How often queued stream bytes are drained while streaming.
    pub update_interval: Duration,

    /// How long to wait before a reconnect attempt.
    pub reconnect_backoff: Duration,

    /// Minimum spacing between outbound channel batches.
    pub batch_interval: Duration,

    /// Liveness write spacing.
    pub heartbeat_interval: Duration,

    /// Retry spacing after a failed liveness write.
    pub heartbeat_penalty: Duration,

    /// Maximum HTTPS redirects honored while connecting the stream.
    pub max_redirects: usize,

    /// When true, a value arriving right after a reconnect whose hash matches
    /// the cached hash still invokes the channel callback (with
    /// `changed == false`) instead of being dropped as a resync no-op.
    pub notify_on_resync: bool,

    /// Whether to send periodic liveness writes at all.
    pub heartbeat_enabled: bool,
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        device_id: impl Into<String>,
        writer_id: impl Into<String>,
        channel_count: usize,
    ) -> Self {
        Self {
            host: host.into(),
            device_id: device_id.into(),
            writer_id: writer_id.into(),
            channel_count,
            schedule_capacity: 20,
            max_value_len: 32,
            update_interval: Duration::from_millis(750),
            reconnect_backoff: Duration::from_secs(5),
            batch_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(120),
            heartbeat_penalty: Duration::from_secs(2),
            max_redirects: 5,
            notify_on_resync: false,
            heartbeat_enabled: true,
        }
    }

    /// The subscribe path for this device, before `$uid` substitution.
    pub fn stream_path(&self) -> String {
        format!(
            "{}{}/{}",
            STREAM_PATH_PREFIX, self.device_id, STREAM_PATH_SUFFIX
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ClientError::Config("host must not be empty".to_string()));
        }
        if self.device_id.is_empty() {
            return Err(ClientError::Config(
                "device id must not be empty".to_string(),
            ));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(ClientError::Config(format!(
                "channel count must be 1..={MAX_CHANNELS}, got {}",
                self.channel_count
            )));
        }
        if self.schedule_capacity > MAX_SCHEDULES {
            return Err(ClientError::Config(format!(
                "schedule capacity must be <= {MAX_SCHEDULES}, got {}",
                self.schedule_capacity
            )));
        }
        if self.writer_id.is_empty() || self.writer_id.len() > MAX_WRITER_ID_LEN {
            return Err(ClientError::Config(format!(
                "writer id must be 1..={MAX_WRITER_ID_LEN} bytes",
            )));
        }
        if self.max_value_len == 0 {
            return Err(ClientError::Config(
                "max value length must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
