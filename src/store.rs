//! Channel state store.
//!
//! One pre-allocated slot per channel: hash of the last accepted value,
//! the value itself (scheduled increments read it back), the pending
//! outbound value, and a dirty flag. Remote updates run through self-echo
//! and resync suppression before touching a slot; local writes always
//! dirty the slot, even when the value is unchanged.

use crate::bounded::BoundedBuf;
use crate::error::{ClientError, Result};
use tracing::debug;
use xxhash_rust::xxh32::xxh32;

pub type ChannelCallback = Box<dyn FnMut(&str, bool) + Send>;

/// Why a remote update did not reach the channel callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The update carries this device's own writer id: it is the echo of an
    /// outbound write, already reflected locally.
    SelfEcho,
    /// First exchange after a (re)connect and the value hash matches the
    /// cached hash: treated as a no-op resync.
    ResyncUnchanged,
}

/// Result of applying one remote update to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { changed: bool },
    Suppressed(SuppressReason),
}

/// One dirty channel captured at batch-build time.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub index: usize,
    pub value: String,
    seq: u64,
}

struct ChannelSlot {
    last_hash: Option<u32>,
    last_value: BoundedBuf,
    pending: BoundedBuf,
    dirty: bool,
    /// Bumped on every local write; lets batch confirmation tell whether the
    /// slot was rewritten while its value was in flight.
    seq: u64,
    callback: Option<ChannelCallback>,
}

pub struct ChannelStore {
    slots: Vec<ChannelSlot>,
    writer_id: String,
    max_value_len: usize,
    notify_on_resync: bool,
    /// Set on every fresh (re)connection, cleared by the first update of any
    /// kind. While set, cached hashes are not trusted for echo suppression.
    resync: bool,
}

impl ChannelStore {
    pub fn new(
        channel_count: usize,
        max_value_len: usize,
        writer_id: impl Into<String>,
        notify_on_resync: bool,
    ) -> Self {
        let slots = (0..channel_count)
            .map(|_| ChannelSlot {
                last_hash: None,
                last_value: BoundedBuf::new(max_value_len),
                pending: BoundedBuf::new(max_value_len),
                dirty: false,
                seq: 0,
                callback: None,
            })
            .collect();
        Self {
            slots,
            writer_id: writer_id.into(),
            max_value_len,
            notify_on_resync,
            resync: false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    pub fn set_callback(&mut self, index: usize, callback: ChannelCallback) -> Result<()> {
        let slot = self.slot_mut(index)?;
        slot.callback = Some(callback);
        Ok(())
    }

    /// The stream (re)connected; cached state can no longer be trusted to
    /// reflect what happened while disconnected.
    pub fn note_reconnected(&mut self) {
        self.resync = true;
    }

    /// A full update event finished parsing. Covers updates that never touch
    /// a channel slot (schedule-only events).
    pub fn note_update_event(&mut self) {
        self.resync = false;
    }

    pub fn resync_pending(&self) -> bool {
        self.resync
    }

    /// Apply one update received from the stream (or synthesized by the
    /// schedule engine, with its own writer tag).
    pub fn apply_remote(
        &mut self,
        index: usize,
        value: &str,
        writer: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let resync = self.resync;
        let notify_on_resync = self.notify_on_resync;
        let is_echo = !resync && writer == Some(self.writer_id.as_str());
        let slot = self.slot_mut(index)?;

        let outcome = if is_echo {
            debug!(channel = index, "update was self-made, ignoring");
            UpdateOutcome::Suppressed(SuppressReason::SelfEcho)
        } else {
            let hash = xxh32(value.as_bytes(), 0);
            let changed = slot.last_hash != Some(hash);
            if resync && !changed && !notify_on_resync {
                debug!(channel = index, "unchanged value on resync, ignoring");
                UpdateOutcome::Suppressed(SuppressReason::ResyncUnchanged)
            } else {
                slot.last_hash = Some(hash);
                slot.last_value
                    .set(value)
                    .map_err(|max| ClientError::ValueTooLong { max })?;
                if let Some(cb) = slot.callback.as_mut() {
                    cb(value, changed);
                }
                UpdateOutcome::Applied { changed }
            }
        };

        // Any update clears the resync window, including suppressed ones.
        self.resync = false;
        Ok(outcome)
    }

    /// Queue a local write. Always dirties the slot and overwrites any
    /// earlier pending value; only the latest value is ever sent.
    pub fn write(&mut self, index: usize, value: &str) -> Result<()> {
        let slot = self.slot_mut(index)?;
        slot.pending
            .set(value)
            .map_err(|max| ClientError::ValueTooLong { max })?;
        slot.dirty = true;
        slot.seq += 1;
        Ok(())
    }

    /// Last accepted value for a channel. Empty sentinel if never set.
    pub fn last_value(&self, index: usize) -> Result<ChannelValue<'_>> {
        let slot = self
            .slots
            .get(index)
            .ok_or(ClientError::ChannelRange {
                index,
                capacity: self.slots.len(),
            })?;
        Ok(ChannelValue {
            raw: slot.last_value.as_str().unwrap_or(""),
        })
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count()
    }

    /// Capture every dirty channel for one outbound batch.
    pub fn snapshot_dirty(&self) -> Vec<PendingWrite> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dirty)
            .map(|(index, s)| PendingWrite {
                index,
                value: s.pending.as_str().unwrap_or("").to_string(),
                seq: s.seq,
            })
            .collect()
    }

    /// A batch built from `sent` was confirmed by the backend. Accept the
    /// sent values as last-known, and clear dirty flags only for slots not
    /// rewritten since the snapshot was taken.
    pub fn confirm_sent(&mut self, sent: &[PendingWrite]) {
        for write in sent {
            let Some(slot) = self.slots.get_mut(write.index) else {
                continue;
            };
            slot.last_hash = Some(xxh32(write.value.as_bytes(), 0));
            // Capacity matches the pending buffer the value came from.
            let _ = slot.last_value.set(&write.value);
            if slot.seq == write.seq {
                slot.dirty = false;
            }
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut ChannelSlot> {
        let capacity = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(ClientError::ChannelRange { index, capacity })
    }
}

/// Read-only view of a channel value with typed accessors.
#[derive(Debug, Clone, Copy)]
pub struct ChannelValue<'a> {
    raw: &'a str,
}

impl<'a> ChannelValue<'a> {
    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.raw.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn store() -> ChannelStore {
        ChannelStore::new(8, 32, "7", false)
    }

    fn counting_callback(store: &mut ChannelStore, index: usize) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        store
            .set_callback(
                index,
                Box::new(move |_, _| {
                    inner.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        count
    }

    #[test]
    fn test_self_echo_suppressed_after_first_update() {
        let mut store = store();
        let count = counting_callback(&mut store, 0);

        // First post-connect update: echo suppression not yet active.
        store.note_reconnected();
        let outcome = store.apply_remote(0, "1", Some("7")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied { changed: true });

        // From now on, own-writer updates never fire the callback or move
        // the hash.
        let outcome = store.apply_remote(0, "2", Some("7")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Suppressed(SuppressReason::SelfEcho));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.last_value(0).unwrap().as_str(), "1");
    }

    #[test]
    fn test_other_writer_fires_callback() {
        // A batch value tagged with a foreign writer id reaches the
        // callback.
        let mut store = store();
        let count = counting_callback(&mut store, 2);
        let outcome = store.apply_remote(2, "19.5", Some("0")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied { changed: true });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resync_suppresses_unchanged_value() {
        // An unchanged value right after reconnect is dropped, but the
        // resync window still closes.
        let mut store = store();
        store.apply_remote(5, "on", Some("app")).unwrap();
        let count = counting_callback(&mut store, 5);

        store.note_reconnected();
        assert!(store.resync_pending());
        let outcome = store.apply_remote(5, "on", Some("app")).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Suppressed(SuppressReason::ResyncUnchanged)
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!store.resync_pending());
    }

    #[test]
    fn test_resync_changed_value_applies() {
        let mut store = store();
        store.apply_remote(5, "on", Some("app")).unwrap();
        store.note_reconnected();
        let outcome = store.apply_remote(5, "off", Some("app")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied { changed: true });
    }

    #[test]
    fn test_notify_on_resync_flag() {
        let mut store = ChannelStore::new(8, 32, "7", true);
        store.apply_remote(5, "on", Some("app")).unwrap();
        let count = counting_callback(&mut store, 5);

        store.note_reconnected();
        let outcome = store.apply_remote(5, "on", Some("app")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied { changed: false });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_write_never_deduplicated() {
        let mut store = store();
        store.write(1, "42").unwrap();
        let snapshot = store.snapshot_dirty();
        store.confirm_sent(&snapshot);
        assert_eq!(store.dirty_count(), 0);

        // Same value again still dirties the slot.
        store.write(1, "42").unwrap();
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn test_confirm_clears_only_snapshot_state() {
        // A channel rewritten while its batch is in flight stays dirty.
        let mut store = store();
        store.write(0, "a").unwrap();
        store.write(3, "b").unwrap();
        let snapshot = store.snapshot_dirty();
        assert_eq!(snapshot.len(), 2);

        store.write(3, "c").unwrap();
        store.confirm_sent(&snapshot);

        assert_eq!(store.dirty_count(), 1);
        let next = store.snapshot_dirty();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].index, 3);
        assert_eq!(next[0].value, "c");
    }

    #[test]
    fn test_confirm_updates_last_value_and_hash() {
        // After a confirmed batch the sent value is the last-known value,
        // and its echo is suppressed.
        let mut store = store();
        store.apply_remote(0, "seed", Some("app")).unwrap();
        store.write(0, "42").unwrap();
        let snapshot = store.snapshot_dirty();
        store.confirm_sent(&snapshot);

        assert_eq!(store.last_value(0).unwrap().as_str(), "42");
        let outcome = store.apply_remote(0, "42", Some("7")).unwrap();
        assert_eq!(outcome, UpdateOutcome::Suppressed(SuppressReason::SelfEcho));
    }

    #[test]
    fn test_value_too_long_rejected() {
        let mut store = store();
        let long = "x".repeat(33);
        assert!(matches!(
            store.write(0, &long),
            Err(ClientError::ValueTooLong { max: 32 })
        ));
        assert_eq!(store.dirty_count(), 0);
    }

    #[test]
    fn test_out_of_range_index() {
        let mut store = store();
        assert!(matches!(
            store.apply_remote(8, "v", None),
            Err(ClientError::ChannelRange { index: 8, .. })
        ));
    }

    #[test]
    fn test_channel_value_accessors() {
        let mut store = store();
        assert!(store.last_value(0).unwrap().is_empty());
        store.apply_remote(0, "15", Some("app")).unwrap();
        let value = store.last_value(0).unwrap();
        assert_eq!(value.as_i64(), Some(15));
        assert_eq!(value.as_f64(), Some(15.0));
        store.apply_remote(0, "on", Some("app")).unwrap();
        assert_eq!(store.last_value(0).unwrap().as_i64(), None);
    }
}
