//! Cron-driven channel mutations.
//!
//! A sparse, fixed-capacity job table. Jobs arrive over the stream (or are
//! installed directly), are validated once, and fire when their next
//! execution time is due. Firing writes the target channel and recomputes
//! the next execution from the cron expression; evaluation itself is
//! delegated to the `cron` crate.

use crate::error::{ClientError, Result};
use crate::store::ChannelStore;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use tracing::{debug, warn};

/// Writer tag attached to channel values produced by schedule firings.
pub const SCHEDULE_WRITER: &str = "sched";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Set,
    Increment,
    Decrement,
}

impl JobMode {
    /// Wire encoding is a single mode character; anything unrecognized
    /// behaves as SET.
    pub fn from_wire(c: char) -> Self {
        match c.to_ascii_lowercase() {
            'i' => JobMode::Increment,
            'd' => JobMode::Decrement,
            _ => JobMode::Set,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleJob {
    pub id: usize,
    pub cron: String,
    pub channel: usize,
    pub mode: JobMode,
    pub operand: String,
    pub next_execution: Option<DateTime<Utc>>,
    schedule: CronSchedule,
}

pub type ScheduleCallback = Box<dyn FnMut(&ScheduleJob, &str) + Send>;

pub struct ScheduleEngine {
    jobs: Vec<Option<ScheduleJob>>,
    callbacks: Vec<Option<ScheduleCallback>>,
    channel_count: usize,
}

impl ScheduleEngine {
    pub fn new(capacity: usize, channel_count: usize) -> Self {
        Self {
            jobs: (0..capacity).map(|_| None).collect(),
            callbacks: (0..capacity).map(|_| None).collect(),
            channel_count,
        }
    }

    pub fn capacity(&self) -> usize {
        self.jobs.len()
    }

    pub fn job(&self, id: usize) -> Option<&ScheduleJob> {
        self.jobs.get(id).and_then(|j| j.as_ref())
    }

    pub fn set_callback(&mut self, id: usize, callback: ScheduleCallback) -> Result<()> {
        if id >= self.callbacks.len() {
            return Err(ClientError::ScheduleRejected(format!(
                "schedule id {id} out of range"
            )));
        }
        self.callbacks[id] = Some(callback);
        Ok(())
    }

    /// Install or replace a job. Any validation failure frees the slot and
    /// rejects the definition; a half-updated job is never left behind.
    pub fn install(
        &mut self,
        id: usize,
        cron_expr: &str,
        channel: usize,
        mode: JobMode,
        operand: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if id >= self.jobs.len() {
            return Err(ClientError::ScheduleRejected(format!(
                "schedule id {id} exceeds capacity {}",
                self.jobs.len()
            )));
        }
        self.jobs[id] = None;

        if channel >= self.channel_count {
            return Err(ClientError::ScheduleRejected(format!(
                "target channel {channel} out of range"
            )));
        }
        if cron_expr.is_empty() {
            return Err(ClientError::ScheduleRejected(
                "empty cron expression".to_string(),
            ));
        }
        let schedule = CronSchedule::from_str(cron_expr).map_err(|e| {
            ClientError::ScheduleRejected(format!("cron parse failed for {cron_expr:?}: {e}"))
        })?;

        let next_execution = schedule.after(&now).next();
        debug!(id, channel, cron = cron_expr, next = ?next_execution, "schedule installed");
        self.jobs[id] = Some(ScheduleJob {
            id,
            cron: cron_expr.to_string(),
            channel,
            mode,
            operand: operand.to_string(),
            next_execution,
            schedule,
        });
        Ok(())
    }

    pub fn remove(&mut self, id: usize) {
        if let Some(slot) = self.jobs.get_mut(id) {
            *slot = None;
        }
    }

    /// Fire every due job, writing its target channel and recomputing the
    /// next execution relative to `now`.
    pub fn tick(&mut self, now: DateTime<Utc>, channels: &mut ChannelStore) {
        for id in 0..self.jobs.len() {
            let Some(job) = self.jobs[id].as_mut() else {
                continue;
            };
            let Some(due) = job.next_execution else {
                continue;
            };
            if due > now {
                continue;
            }

            let written = match job.mode {
                JobMode::Set => Some(job.operand.clone()),
                JobMode::Increment | JobMode::Decrement => {
                    match job.operand.parse::<f64>() {
                        Err(_) => {
                            warn!(id, operand = %job.operand, "job operand is not numeric, skipping write");
                            None
                        }
                        Ok(op) => {
                            let current = channels
                                .last_value(job.channel)
                                .ok()
                                .and_then(|v| v.as_f64());
                            match current {
                                // Non-numeric channel contents: re-seed with
                                // the operand.
                                None => Some(job.operand.clone()),
                                Some(cur) => {
                                    let next = if job.mode == JobMode::Increment {
                                        cur + op
                                    } else {
                                        cur - op
                                    };
                                    Some(format!("{next}"))
                                }
                            }
                        }
                    }
                }
            };

            if let Some(value) = written.as_deref() {
                if let Err(e) = channels.write(job.channel, value) {
                    warn!(id, channel = job.channel, error = %e, "scheduled write failed");
                } else {
                    // The channel's own callback observes the scheduled
                    // mutation, and the cached hash stays coherent for the
                    // next increment.
                    let _ = channels.apply_remote(job.channel, value, Some(SCHEDULE_WRITER));
                }
            }

            job.next_execution = job.schedule.after(&now).next();
            debug!(id, next = ?job.next_execution, "schedule fired");

            if let Some(cb) = self.callbacks[id].as_mut() {
                cb(job, written.as_deref().unwrap_or(""));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DAILY_NOON: &str = "0 0 12 * * *";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn engine() -> (ScheduleEngine, ChannelStore) {
        (
            ScheduleEngine::new(4, 8),
            ChannelStore::new(8, 32, "7", false),
        )
    }

    #[test]
    fn test_install_computes_next_execution() {
        let (mut engine, _) = engine();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();
        let job = engine.job(0).unwrap();
        let next = job.next_execution.unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_install_rejects_bad_cron() {
        let (mut engine, _) = engine();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();
        // A bad redefinition frees the slot rather than keeping the old job.
        assert!(engine
            .install(0, "not a cron", 1, JobMode::Set, "on", now())
            .is_err());
        assert!(engine.job(0).is_none());
    }

    #[test]
    fn test_install_rejects_bad_channel_and_id() {
        let (mut engine, _) = engine();
        assert!(engine
            .install(0, DAILY_NOON, 99, JobMode::Set, "on", now())
            .is_err());
        assert!(engine
            .install(17, DAILY_NOON, 1, JobMode::Set, "on", now())
            .is_err());
    }

    #[test]
    fn test_set_fires_and_recomputes() {
        let (mut engine, mut channels) = engine();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();

        let fire_time = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        engine.tick(fire_time, &mut channels);

        assert_eq!(channels.last_value(1).unwrap().as_str(), "on");
        assert_eq!(channels.dirty_count(), 1);
        let next = engine.job(0).unwrap().next_execution.unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_increment_adds_to_numeric_channel() {
        // Current "10", operand "5", increment -> "15".
        let (mut engine, mut channels) = engine();
        channels.apply_remote(2, "10", Some("app")).unwrap();
        engine
            .install(0, DAILY_NOON, 2, JobMode::Increment, "5", now())
            .unwrap();

        let fire_time = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        engine.tick(fire_time, &mut channels);

        assert_eq!(channels.last_value(2).unwrap().as_str(), "15");
        let next = engine.job(0).unwrap().next_execution.unwrap();
        assert!(next > fire_time);
    }

    #[test]
    fn test_decrement_subtracts() {
        let (mut engine, mut channels) = engine();
        channels.apply_remote(2, "10.5", Some("app")).unwrap();
        engine
            .install(0, DAILY_NOON, 2, JobMode::Decrement, "0.5", now())
            .unwrap();
        engine.tick(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), &mut channels);
        assert_eq!(channels.last_value(2).unwrap().as_str(), "10");
    }

    #[test]
    fn test_increment_reseeds_non_numeric_channel() {
        let (mut engine, mut channels) = engine();
        channels.apply_remote(2, "off", Some("app")).unwrap();
        engine
            .install(0, DAILY_NOON, 2, JobMode::Increment, "5", now())
            .unwrap();
        engine.tick(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), &mut channels);
        assert_eq!(channels.last_value(2).unwrap().as_str(), "5");
    }

    #[test]
    fn test_bad_operand_skips_write_but_advances() {
        let (mut engine, mut channels) = engine();
        channels.apply_remote(2, "10", Some("app")).unwrap();
        engine
            .install(0, DAILY_NOON, 2, JobMode::Increment, "garbage", now())
            .unwrap();
        let fire_time = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        engine.tick(fire_time, &mut channels);

        assert_eq!(channels.last_value(2).unwrap().as_str(), "10");
        assert_eq!(channels.dirty_count(), 0);
        assert!(engine.job(0).unwrap().next_execution.unwrap() > fire_time);
    }

    #[test]
    fn test_not_due_jobs_do_not_fire() {
        let (mut engine, mut channels) = engine();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();
        engine.tick(now(), &mut channels);
        assert_eq!(channels.dirty_count(), 0);
    }

    #[test]
    fn test_next_execution_monotonic_over_repeated_fires() {
        // Recomputed next execution never moves backwards.
        let (mut engine, mut channels) = engine();
        engine
            .install(0, "0 */5 * * * *", 1, JobMode::Set, "x", now())
            .unwrap();

        let mut previous = engine.job(0).unwrap().next_execution.unwrap();
        for _ in 0..5 {
            let fire_time = previous;
            engine.tick(fire_time, &mut channels);
            let next = engine.job(0).unwrap().next_execution.unwrap();
            assert!(next > fire_time);
            previous = next;
        }
    }

    #[test]
    fn test_callback_receives_written_value() {
        use std::sync::{Arc, Mutex};

        let (mut engine, mut channels) = engine();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();
        engine
            .set_callback(
                0,
                Box::new(move |job, written| {
                    inner.lock().unwrap().push(format!("{}:{written}", job.id));
                }),
            )
            .unwrap();

        engine.tick(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), &mut channels);
        assert_eq!(seen.lock().unwrap().as_slice(), &["0:on".to_string()]);
    }

    #[test]
    fn test_channel_callback_observes_scheduled_write() {
        use std::sync::{Arc, Mutex};

        let (mut engine, mut channels) = engine();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        channels
            .set_callback(
                1,
                Box::new(move |value, _| {
                    inner.lock().unwrap().push(value.to_string());
                }),
            )
            .unwrap();
        engine
            .install(0, DAILY_NOON, 1, JobMode::Set, "on", now())
            .unwrap();
        engine.tick(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), &mut channels);
        assert_eq!(seen.lock().unwrap().as_slice(), &["on".to_string()]);
    }
}
