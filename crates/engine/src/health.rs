//! Heartbeat health classification.
//!
//! Classifies a heartbeat arrival against the expected window of the VM's
//! monitor record and applies the resulting mutation. The engine is pure:
//! the arrival time is a parameter and every platform interaction stays with
//! the orchestrator.

use autoscale_core::{HealthCheckRecord, HealthCheckResult, SyncState};
use tracing::debug;

/// Classification parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Missed-window budget before a VM is dropped from the cluster
    pub max_loss_count: u32,
    /// Tolerated seconds beyond the expected arrival
    pub delay_allowance_sec: u64,
    /// Consecutive in-window arrivals required to rejoin the cluster
    pub max_sync_recovery_count: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            max_loss_count: 3,
            delay_allowance_sec: 2,
            max_sync_recovery_count: 3,
        }
    }
}

/// Heartbeat window classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheckEngine {
    config: HealthCheckConfig,
}

impl HealthCheckEngine {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self { config }
    }

    /// Classifies one arrival and applies the resulting record mutation
    ///
    /// Accepted arrivals advance `next_heartbeat_time` and bump `seq`.
    /// Out-of-sync records mutate only on the recovery path; a late arrival
    /// with no recovery in progress leaves the record untouched.
    pub fn classify(&self, record: &mut HealthCheckRecord, t_now: u64) -> HealthCheckResult {
        let interval_ms = record.heartbeat_interval * 1000;
        let expected = record.next_heartbeat_time;
        let allowance_ms = self.config.delay_allowance_sec * 1000;

        if record.sync_state == SyncState::OutOfSync {
            return self.classify_recovery(record, t_now, interval_ms);
        }

        if t_now <= expected {
            record.heartbeat_loss_count = 0;
            record.seq += 1;
            record.next_heartbeat_time = t_now + interval_ms;
            record.healthy = true;
            HealthCheckResult::OnTime
        } else if t_now - expected <= allowance_ms {
            debug!(
                vm_id = %record.vm_id,
                delay_ms = t_now - expected,
                "heartbeat arrived within the delay allowance"
            );
            record.heartbeat_loss_count = 0;
            record.seq += 1;
            record.next_heartbeat_time = t_now + interval_ms;
            record.healthy = true;
            HealthCheckResult::Late
        } else if record.heartbeat_loss_count + 1 < self.config.max_loss_count {
            record.heartbeat_loss_count += 1;
            record.next_heartbeat_time = expected + interval_ms;
            HealthCheckResult::TooLate
        } else {
            record.heartbeat_loss_count += 1;
            record.healthy = false;
            record.sync_state = SyncState::OutOfSync;
            record.sync_recovery_count = 0;
            // Keep a live window so the recovery path has something to hit
            record.next_heartbeat_time = t_now + interval_ms;
            HealthCheckResult::Dropped
        }
    }

    fn classify_recovery(
        &self,
        record: &mut HealthCheckRecord,
        t_now: u64,
        interval_ms: u64,
    ) -> HealthCheckResult {
        if t_now <= record.next_heartbeat_time {
            record.sync_recovery_count += 1;
            record.seq += 1;
            record.next_heartbeat_time = t_now + interval_ms;
            if record.sync_recovery_count >= self.config.max_sync_recovery_count {
                record.sync_state = SyncState::InSync;
                record.sync_recovery_count = 0;
                record.heartbeat_loss_count = 0;
                record.healthy = true;
                return HealthCheckResult::Recovered;
            }
            return HealthCheckResult::Recovering;
        }
        if record.sync_recovery_count > 0 {
            // A miss breaks the consecutive run
            record.sync_recovery_count = 0;
        }
        HealthCheckResult::Dropped
    }

    /// Judges whether a monitored VM counts as a healthy cluster member at
    /// `t_now`, without an arrival
    ///
    /// A VM stays healthy until its remaining missed-window budget is spent:
    /// the deadline is the expected arrival plus the unused loss budget plus
    /// the delay allowance. This is how peers detect a silent primary.
    pub fn judge_healthy(&self, record: &HealthCheckRecord, t_now: u64) -> bool {
        if !record.healthy || !record.is_participating() {
            return false;
        }
        let interval_ms = record.heartbeat_interval * 1000;
        let allowance_ms = self.config.delay_allowance_sec * 1000;
        let remaining_budget = self
            .config
            .max_loss_count
            .saturating_sub(record.heartbeat_loss_count) as u64;
        let deadline = record.next_heartbeat_time + remaining_budget * interval_ms + allowance_ms;
        t_now <= deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(interval: u64) -> HealthCheckRecord {
        HealthCheckRecord::first_heartbeat("i-01", "primary", "10.0.0.4", "", interval, 0)
    }

    fn engine() -> HealthCheckEngine {
        HealthCheckEngine::new(HealthCheckConfig {
            max_loss_count: 3,
            delay_allowance_sec: 2,
            max_sync_recovery_count: 2,
        })
    }

    #[test]
    fn test_on_time_advances_window() {
        let engine = engine();
        let mut rec = record(30);
        assert_eq!(rec.next_heartbeat_time, 30_000);

        assert_eq!(engine.classify(&mut rec, 29_000), HealthCheckResult::OnTime);
        assert_eq!(rec.seq, 2);
        assert_eq!(rec.heartbeat_loss_count, 0);
        assert_eq!(rec.next_heartbeat_time, 59_000);
    }

    #[test]
    fn test_monotone_seq_over_accepted_heartbeats() {
        let engine = engine();
        let mut rec = record(30);
        let mut t = 0u64;
        for expected_seq in 2..=10u64 {
            t += 29_000;
            assert!(engine.classify(&mut rec, t).is_accepted());
            assert_eq!(rec.seq, expected_seq);
        }
        assert!(rec.next_heartbeat_time > t);
    }

    #[test]
    fn test_late_within_allowance() {
        let engine = engine();
        let mut rec = record(30);
        assert_eq!(engine.classify(&mut rec, 31_500), HealthCheckResult::Late);
        assert_eq!(rec.next_heartbeat_time, 61_500);
        assert_eq!(rec.heartbeat_loss_count, 0);
    }

    #[test]
    fn test_too_late_increments_loss() {
        let engine = engine();
        let mut rec = record(30);
        assert_eq!(engine.classify(&mut rec, 40_000), HealthCheckResult::TooLate);
        assert_eq!(rec.heartbeat_loss_count, 1);
        assert_eq!(rec.next_heartbeat_time, 60_000);
        // seq unchanged: the arrival was not accepted
        assert_eq!(rec.seq, 1);
    }

    #[test]
    fn test_drop_after_loss_budget() {
        let engine = engine();
        let mut rec = record(30);
        assert_eq!(engine.classify(&mut rec, 40_000), HealthCheckResult::TooLate);
        assert_eq!(engine.classify(&mut rec, 70_000), HealthCheckResult::TooLate);
        assert_eq!(engine.classify(&mut rec, 100_000), HealthCheckResult::Dropped);
        assert!(!rec.healthy);
        assert_eq!(rec.sync_state, SyncState::OutOfSync);
    }

    #[test]
    fn test_out_of_sync_absorbs_late_arrivals() {
        let engine = engine();
        let mut rec = record(30);
        rec.sync_state = SyncState::OutOfSync;
        rec.healthy = false;

        let before = rec.clone();
        let check_time = rec.next_heartbeat_time + 60_000;
        assert_eq!(
            engine.classify(&mut rec, check_time),
            HealthCheckResult::Dropped
        );
        assert_eq!(rec, before);
    }

    #[test]
    fn test_recovery_after_consecutive_on_time() {
        let engine = engine();
        let mut rec = record(30);
        rec.sync_state = SyncState::OutOfSync;
        rec.healthy = false;

        let t1 = rec.next_heartbeat_time - 1_000;
        assert_eq!(engine.classify(&mut rec, t1), HealthCheckResult::Recovering);
        assert_eq!(rec.sync_recovery_count, 1);
        assert_eq!(rec.sync_state, SyncState::OutOfSync);

        let t2 = rec.next_heartbeat_time - 1_000;
        assert_eq!(engine.classify(&mut rec, t2), HealthCheckResult::Recovered);
        assert_eq!(rec.sync_state, SyncState::InSync);
        assert_eq!(rec.sync_recovery_count, 0);
        assert!(rec.healthy);
    }

    #[test]
    fn test_recovery_run_broken_by_miss() {
        let engine = engine();
        let mut rec = record(30);
        rec.sync_state = SyncState::OutOfSync;
        rec.healthy = false;

        let t1 = rec.next_heartbeat_time - 1_000;
        assert_eq!(engine.classify(&mut rec, t1), HealthCheckResult::Recovering);

        let late = rec.next_heartbeat_time + 10_000;
        assert_eq!(engine.classify(&mut rec, late), HealthCheckResult::Dropped);
        assert_eq!(rec.sync_recovery_count, 0);
        assert_eq!(rec.sync_state, SyncState::OutOfSync);
    }

    #[test]
    fn test_judge_healthy_spends_loss_budget() {
        let engine = engine();
        let rec = record(30);
        // Deadline: 30s expected + 3 spare windows + 2s allowance
        assert!(engine.judge_healthy(&rec, 0));
        assert!(engine.judge_healthy(&rec, 122_000));
        assert!(!engine.judge_healthy(&rec, 122_001));
    }

    #[test]
    fn test_judge_healthy_rejects_dropped() {
        let engine = engine();
        let mut rec = record(30);
        rec.healthy = false;
        assert!(!engine.judge_healthy(&rec, 0));

        let mut rec = record(30);
        rec.sync_state = SyncState::OutOfSync;
        assert!(!engine.judge_healthy(&rec, 0));
    }
}
