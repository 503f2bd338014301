//! Incremental update dispatch.
//!
//! Invoked with a live byte cursor positioned right after a `data:` marker.
//! Updates are decoded one entry at a time and routed to the channel store
//! or schedule engine as they are found; no intermediate document is ever
//! materialized. A malformed entry is skipped and scanning continues; every
//! marker search treats the event's newline as a hard stop so a truncated
//! update can never consume bytes belonging to the next event.
//!
//! Wire shapes:
//!
//! ```text
//! single channel:  {"path":"/CH1/d","data":"251907"}
//! single schedule: {"path":"/SC0","data":{"md":"s","cn":"0","vl":"1","cron":"..."}}
//! batch:           {"path":"/","data":{"CH0":{"d":"0","w":"app"},"SC0":{...}}}
//! ```

use crate::bounded::BoundedBuf;
use crate::config::MAX_WRITER_ID_LEN;
use crate::scan::{self, CopyEnd};
use crate::schedule::{JobMode, ScheduleEngine};
use crate::store::ChannelStore;
use chrono::{DateTime, Utc};
use std::io;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Path keys are `CH{n}`/`SC{n}` plus an optional `/d` suffix.
const PATH_KEY_LEN: usize = 8;

/// Routes decoded updates into the shared channel/schedule tables.
pub struct Dispatcher<'a> {
    pub channels: &'a mut ChannelStore,
    pub schedules: &'a mut ScheduleEngine,
}

impl Dispatcher<'_> {
    /// Decode exactly one update from the cursor. Returns whether a
    /// recognizable update was found (a `"path"` key before end of line).
    pub async fn dispatch<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
        now: DateTime<Utc>,
    ) -> io::Result<bool> {
        match scan::find_first(r, &["\"path\":\"/", "\n"], true, false).await? {
            Some(0) => {}
            _ => {
                debug!("no path in stream update, ignoring");
                return Ok(false);
            }
        }

        match scan::read_byte(r).await? {
            Some(b'"') => self.batch(r, now).await?,
            Some(b'C') => self.single_channel(r).await?,
            Some(b'S') => self.single_schedule(r, now).await?,
            other => {
                debug!(?other, "unrecognized update path prefix");
                return Ok(false);
            }
        }

        // First parsed update of any kind closes the resync window.
        self.channels.note_update_event();
        Ok(true)
    }

    /// `/CH{n}/d` path: one channel, value under a `"data"` key.
    async fn single_channel<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> io::Result<()> {
        // Cursor sits after `/C`; the rest of the key reads like `H5/d`.
        let mut key = BoundedBuf::new(PATH_KEY_LEN);
        if scan::copy_until(r, b'"', &mut key).await? != CopyEnd::Terminator {
            return Ok(());
        }
        let index = match parse_path_index(&key, b'H') {
            Some(i) => i,
            None => {
                warn!(key = ?key.as_str(), "bad channel path key");
                return Ok(());
            }
        };
        if index >= self.channels.channel_count() {
            warn!(channel = index, "channel out of range, skipping");
            return Ok(());
        }

        match scan::find_first(r, &["\"data\":\"", "\n"], true, false).await? {
            Some(0) => {}
            _ => {
                debug!(channel = index, "no data key in channel update");
                return Ok(());
            }
        }

        let mut value = BoundedBuf::new(self.channels.max_value_len());
        match scan::copy_until(r, b'"', &mut value).await? {
            CopyEnd::Terminator => {}
            end => {
                warn!(channel = index, ?end, "channel value unterminated, skipping");
                return Ok(());
            }
        }
        let Some(value) = value.as_str() else {
            warn!(channel = index, "channel value is not UTF-8, skipping");
            return Ok(());
        };

        // Single-channel pushes carry no writer tag.
        let _ = self.channels.apply_remote(index, value, None);
        Ok(())
    }

    /// `/SC{n}` path: one schedule definition object.
    async fn single_schedule<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
        now: DateTime<Utc>,
    ) -> io::Result<()> {
        let mut key = BoundedBuf::new(PATH_KEY_LEN);
        if scan::copy_until(r, b'"', &mut key).await? != CopyEnd::Terminator {
            return Ok(());
        }
        let id = match parse_path_index(&key, b'C') {
            Some(i) => i,
            None => {
                warn!(key = ?key.as_str(), "bad schedule path key");
                return Ok(());
            }
        };
        self.schedule_fields(r, id, now).await
    }

    /// Batch object keyed by `CH{n}` / `SC{n}`, entries routed in arrival
    /// order. Bounded by the combined table capacity.
    async fn batch<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
        now: DateTime<Utc>,
    ) -> io::Result<()> {
        let limit = self.channels.channel_count() + self.schedules.capacity();
        for _ in 0..limit {
            let kind = match scan::find_first(r, &["\"CH", "\"SC", "\n"], true, false).await? {
                Some(k @ (0 | 1)) => k,
                _ => {
                    debug!("no more batch entries");
                    return Ok(());
                }
            };

            let mut num = BoundedBuf::new(PATH_KEY_LEN);
            match scan::copy_until(r, b'"', &mut num).await? {
                CopyEnd::Terminator => {}
                CopyEnd::Eof => return Ok(()),
                CopyEnd::Capacity => continue,
            }
            let id = match num.as_str().and_then(|s| s.parse::<usize>().ok()) {
                Some(id) => id,
                None => {
                    debug!(key = ?num.as_str(), "unparsable batch key, skipping");
                    continue;
                }
            };

            match scan::find_first(r, &[":{", "\n"], true, false).await? {
                Some(0) => {}
                _ => {
                    debug!(id, "batch entry has no object body");
                    continue;
                }
            }

            if kind == 0 {
                self.batch_channel(r, id).await?;
            } else if id < self.schedules.capacity() {
                self.schedule_fields(r, id, now).await?;
            } else {
                warn!(id, "schedule id exceeds capacity, skipping");
            }
        }
        Ok(())
    }

    /// One `{"d":"...","w":"..."}` pair inside a batch, fields in any order.
    async fn batch_channel<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
        id: usize,
    ) -> io::Result<()> {
        if id >= self.channels.channel_count() {
            debug!(channel = id, "invalid channel number in batch");
            return Ok(());
        }

        let mut data = BoundedBuf::new(self.channels.max_value_len());
        let mut writer = BoundedBuf::new(MAX_WRITER_ID_LEN);
        let mut data_found = false;

        for _ in 0..3 {
            match scan::find_first(r, &["\"d\":\"", "\"w\":\"", "}", "\n"], true, false).await? {
                Some(0) => {
                    data.clear();
                    match scan::copy_until(r, b'"', &mut data).await? {
                        CopyEnd::Terminator => data_found = true,
                        end => {
                            warn!(channel = id, ?end, "batch value unterminated, skipping");
                            return Ok(());
                        }
                    }
                }
                Some(1) => {
                    writer.clear();
                    if scan::copy_until(r, b'"', &mut writer).await? != CopyEnd::Terminator {
                        return Ok(());
                    }
                }
                _ => break,
            }
        }

        if !data_found {
            debug!(channel = id, "no data for batch channel, skipping");
            return Ok(());
        }
        let Some(value) = data.as_str() else {
            warn!(channel = id, "batch value is not UTF-8, skipping");
            return Ok(());
        };
        let _ = self.channels.apply_remote(id, value, writer.as_str());
        Ok(())
    }

    /// Schedule definition fields (`cn`/`vl`/`md`/`cron`, quoted, any
    /// order). Incomplete definitions free the slot instead of installing.
    async fn schedule_fields<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
        id: usize,
        now: DateTime<Utc>,
    ) -> io::Result<()> {
        let value_cap = self.channels.max_value_len();
        let mut channel: Option<usize> = None;
        let mut operand = String::new();
        let mut mode = JobMode::Set;
        let mut cron = String::new();

        for _ in 0..5 {
            let field = match scan::find_first(
                r,
                &["\"cn\":\"", "\"vl\":\"", "\"md\":\"", "\"cron\":\"", "}", "\n"],
                true,
                false,
            )
            .await?
            {
                Some(f @ (0 | 1 | 2 | 3)) => f,
                _ => break,
            };

            let mut buf = BoundedBuf::new(value_cap);
            if scan::copy_until(r, b'"', &mut buf).await? != CopyEnd::Terminator {
                break;
            }
            let Some(text) = buf.as_str() else { continue };

            match field {
                0 => match text.parse::<usize>() {
                    Ok(cn) => channel = Some(cn),
                    Err(_) => debug!(id, value = text, "unparsable schedule channel"),
                },
                1 => operand = text.to_string(),
                2 => mode = JobMode::from_wire(text.chars().next().unwrap_or('s')),
                _ => cron = text.to_string(),
            }
        }

        let Some(channel) = channel else {
            debug!(id, "schedule definition missing target channel, removing");
            self.schedules.remove(id);
            return Ok(());
        };
        if cron.is_empty() {
            debug!(id, "schedule definition missing cron, removing");
            self.schedules.remove(id);
            return Ok(());
        }

        if let Err(e) = self
            .schedules
            .install(id, &cron, channel, mode, &operand, now)
        {
            debug!(id, error = %e, "schedule rejected");
        }
        Ok(())
    }
}

/// Parse the numeric index out of a path key like `H5/d` or `C0` (the
/// leading type byte was consumed during disambiguation).
fn parse_path_index(key: &BoundedBuf, expected_first: u8) -> Option<usize> {
    let text = key.as_str()?;
    let head = text.split('/').next()?;
    let rest = head.strip_prefix(expected_first as char)?;
    rest.parse().ok()
}
