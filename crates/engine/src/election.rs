//! Primary election state machine.
//!
//! The election runs over the singleton `PrimaryRecord`. Conditional writes
//! keyed on the record's id token serialize candidacy: exactly one writer
//! creates the pending record, every other writer observes `RaceLost` and
//! falls back to watching. Observers of an expired vote may purge and stand
//! themselves. There is no tie-break beyond the conditional write.

use crate::health::HealthCheckEngine;
use autoscale_core::{
    AutoscaleError, PrimaryRecord, Result, VirtualMachine, VmDescriptor, VoteState,
};
use autoscale_platform::{PlatformAdapter, ProxyAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Poll cadence of the bounded waiter
pub const ELECTION_POLL_INTERVAL_MS: u64 = 5000;
/// Execution time every bounded waiter leaves for the handler to wind down
pub const EXECUTION_TIME_RESERVE_MS: u64 = 6000;

/// Election parameters resolved from the settings registry
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Scaling group whose members may stand for the primary role
    pub primary_scaling_group: String,
    /// Seconds a pending vote stays valid
    pub election_timeout_sec: u64,
    /// When set, callers observing a pending vote return instead of waiting
    pub no_wait: bool,
}

/// Result of one election run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This VM holds the finalized record
    Elected(PrimaryRecord),
    /// Another VM holds the finalized record
    Follower(PrimaryRecord),
    /// A vote is still pending and the caller opted not to wait
    Pending(PrimaryRecord),
    /// No record exists and this VM may not stand
    NoPrimary,
    /// The bounded waiter ran out of execution time
    TimedOut,
}

/// What to do about the current record, as a pure function of its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionDecision {
    pub need_election: bool,
    pub purge_existing: bool,
    pub wait_for_pending: bool,
}

impl ElectionDecision {
    /// Evaluates the decision table against the observed record
    ///
    /// `primary_healthy` is `None` when the named VM has no monitor record
    /// yet, which is not evidence of failure: a freshly elected primary has
    /// not produced its first heartbeat.
    pub fn evaluate(
        record: Option<&PrimaryRecord>,
        primary_healthy: Option<bool>,
        t_now: u64,
    ) -> Self {
        match record {
            None => Self {
                need_election: true,
                purge_existing: false,
                wait_for_pending: false,
            },
            Some(r) => match r.vote_state {
                VoteState::Timeout => Self {
                    need_election: true,
                    purge_existing: false,
                    wait_for_pending: false,
                },
                VoteState::Pending if r.is_expired(t_now) => Self {
                    need_election: true,
                    purge_existing: true,
                    wait_for_pending: false,
                },
                VoteState::Pending => Self {
                    need_election: false,
                    purge_existing: false,
                    wait_for_pending: true,
                },
                VoteState::Done => {
                    let healthy = primary_healthy.unwrap_or(true);
                    Self {
                        need_election: !healthy,
                        purge_existing: !healthy,
                        wait_for_pending: false,
                    }
                }
            },
        }
    }
}

/// Drives one VM's participation in the election
pub struct ElectionRunner {
    platform: Arc<dyn PlatformAdapter>,
    proxy: Arc<dyn ProxyAdapter>,
    health: HealthCheckEngine,
    config: ElectionConfig,
}

impl ElectionRunner {
    pub fn new(
        platform: Arc<dyn PlatformAdapter>,
        proxy: Arc<dyn ProxyAdapter>,
        health: HealthCheckEngine,
        config: ElectionConfig,
    ) -> Self {
        Self {
            platform,
            proxy,
            health,
            config,
        }
    }

    /// Runs the election to an outcome on behalf of `self_vm`
    ///
    /// Fails with `LifecycleAbandon` when this VM won the vote but could not
    /// finalize it; the caller completes its lifecycle hook with abandon.
    pub async fn run(&self, self_vm: &VirtualMachine) -> Result<ElectionOutcome> {
        loop {
            if self.proxy.remaining_execution_time_ms() < EXECUTION_TIME_RESERVE_MS {
                self.clear_own_stale_record(self_vm).await;
                warn!(vm_id = %self_vm.vm_id, "election waiter out of execution time");
                return Ok(ElectionOutcome::TimedOut);
            }

            let t_now = self.proxy.now_ms();
            let record = self.platform.get_primary_record().await?;
            let primary_healthy = match &record {
                Some(r) if r.is_done() => self
                    .platform
                    .get_health_check_record(&r.vm_id)
                    .await?
                    .map(|h| self.health.judge_healthy(&h, t_now)),
                _ => None,
            };
            let decision = ElectionDecision::evaluate(record.as_ref(), primary_healthy, t_now);

            if let Some(r) = &record {
                if r.is_done() && !decision.need_election {
                    return Ok(if r.names(self_vm) {
                        ElectionOutcome::Elected(r.clone())
                    } else {
                        ElectionOutcome::Follower(r.clone())
                    });
                }
                if decision.wait_for_pending {
                    if r.names(self_vm) {
                        // Our own vote is in flight; only we may finalize it
                        return self.finalize(r.clone(), self_vm).await;
                    }
                    if self.config.no_wait {
                        return Ok(ElectionOutcome::Pending(r.clone()));
                    }
                    debug!(candidate = %r.vm_id, "waiting on a pending vote");
                    sleep(Duration::from_millis(ELECTION_POLL_INTERVAL_MS)).await;
                    continue;
                }
            }

            let purged = if decision.purge_existing {
                match &record {
                    Some(r) => {
                        self.purge(r).await?;
                        true
                    }
                    None => false,
                }
            } else {
                false
            };

            if self_vm.scaling_group_name != self.config.primary_scaling_group {
                // Not eligible to stand; watch for someone who is
                if record.is_none() && self.config.no_wait {
                    return Ok(ElectionOutcome::NoPrimary);
                }
                sleep(Duration::from_millis(ELECTION_POLL_INTERVAL_MS)).await;
                continue;
            }

            let expected = match &record {
                Some(r) if r.vote_state == VoteState::Timeout => Some(r),
                Some(_) if !purged => {
                    // The record changed shape underneath us; re-read
                    continue;
                }
                _ => None,
            };

            let vote_end_time = t_now + self.config.election_timeout_sec * 1000;
            let candidate = PrimaryRecord::new_vote(self_vm, vote_end_time);
            match self
                .platform
                .create_primary_record(&candidate, expected)
                .await
            {
                Ok(()) => {
                    info!(vm_id = %self_vm.vm_id, "vote placed; this VM is the sole candidate");
                    return self.finalize(candidate, self_vm).await;
                }
                Err(err) if err.is_race_lost() => {
                    debug!(vm_id = %self_vm.vm_id, "lost the candidacy race");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Finalizes a pending vote this VM placed
    async fn finalize(
        &self,
        record: PrimaryRecord,
        self_vm: &VirtualMachine,
    ) -> Result<ElectionOutcome> {
        if !record.names(self_vm) {
            return Ok(ElectionOutcome::Pending(record));
        }
        let done = record.finalized();
        match self.platform.update_primary_record(&done).await {
            Ok(()) => {
                info!(vm_id = %done.vm_id, ip = %done.ip, "primary election finalized");
                Ok(ElectionOutcome::Elected(done))
            }
            Err(err) => {
                warn!(vm_id = %record.vm_id, %err, "finalize failed; clearing the vote");
                if let Err(del_err) = self.platform.delete_primary_record(&record).await {
                    if !del_err.is_race_lost() {
                        warn!(%del_err, "stale vote cleanup failed");
                    }
                }
                Err(AutoscaleError::LifecycleAbandon {
                    vm_id: self_vm.vm_id.clone(),
                })
            }
        }
    }

    /// Purges a failed or expired record; a lost race means someone else
    /// already purged
    async fn purge(&self, record: &PrimaryRecord) -> Result<()> {
        info!(vm_id = %record.vm_id, state = %record.vote_state, "purging primary record");
        match self.platform.delete_primary_record(record).await {
            Ok(()) => {}
            Err(err) if err.is_race_lost() => {
                debug!("primary record already purged by another handler");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        // A deposed incumbent leaves the cluster entirely
        if record.is_done() {
            if let Some(mut health) = self
                .platform
                .get_health_check_record(&record.vm_id)
                .await?
            {
                if health.is_participating() {
                    health.sync_state = autoscale_core::SyncState::OutOfSync;
                    health.healthy = false;
                    health.sync_recovery_count = 0;
                    if let Err(err) = self.platform.update_health_check_record(&health).await {
                        warn!(vm_id = %record.vm_id, %err, "deposed primary record update failed");
                    }
                }
            }
            if let Some(vm) = self
                .platform
                .describe_vm(&VmDescriptor::by_id(&record.vm_id))
                .await?
            {
                info!(vm_id = %vm.vm_id, "terminating deposed primary");
                self.platform.delete_vm(&vm).await?;
            }
        }
        Ok(())
    }

    /// Best-effort removal of a pending vote this VM owns, on the timeout path
    async fn clear_own_stale_record(&self, self_vm: &VirtualMachine) {
        if let Ok(Some(record)) = self.platform.get_primary_record().await {
            if record.names(self_vm) && record.vote_state == VoteState::Pending {
                if let Err(err) = self.platform.delete_primary_record(&record).await {
                    if !err.is_race_lost() {
                        warn!(vm_id = %self_vm.vm_id, %err, "stale vote cleanup failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckConfig;
    use autoscale_core::{HealthCheckRecord, SyncState};
    use autoscale_platform::{MemoryPlatformAdapter, StaticProxy};

    fn vm(id: &str, group: &str) -> VirtualMachine {
        VirtualMachine {
            vm_id: id.to_string(),
            scaling_group_name: group.to_string(),
            primary_private_ip: format!("10.0.1.{}", id.as_bytes()[id.len() - 1]),
            primary_public_ip: None,
            virtual_network_id: "vnet-1".to_string(),
            subnet_id: "subnet-1".to_string(),
        }
    }

    fn runner(
        platform: &MemoryPlatformAdapter,
        proxy: Arc<StaticProxy>,
        no_wait: bool,
    ) -> ElectionRunner {
        ElectionRunner::new(
            Arc::new(platform.clone()),
            proxy,
            HealthCheckEngine::new(HealthCheckConfig::default()),
            ElectionConfig {
                primary_scaling_group: "primary-group".to_string(),
                election_timeout_sec: 90,
                no_wait,
            },
        )
    }

    #[test]
    fn test_decision_table() {
        let candidate = vm("i-a", "primary-group");
        let pending = PrimaryRecord::new_vote(&candidate, 90_000);
        let done = pending.finalized();
        let mut tombstone = pending.clone();
        tombstone.vote_state = VoteState::Timeout;

        // Absent: elect, nothing to purge
        let d = ElectionDecision::evaluate(None, None, 0);
        assert!(d.need_election && !d.purge_existing && !d.wait_for_pending);

        // Tombstone behaves like absence
        let d = ElectionDecision::evaluate(Some(&tombstone), None, 0);
        assert!(d.need_election && !d.purge_existing);

        // Pending within deadline: wait
        let d = ElectionDecision::evaluate(Some(&pending), None, 50_000);
        assert!(d.wait_for_pending && !d.need_election);

        // Pending past deadline: purge and elect
        let d = ElectionDecision::evaluate(Some(&pending), None, 90_001);
        assert!(d.need_election && d.purge_existing);

        // Done + healthy: settled
        let d = ElectionDecision::evaluate(Some(&done), Some(true), 0);
        assert!(!d.need_election && !d.purge_existing);

        // Done + unhealthy: purge and elect
        let d = ElectionDecision::evaluate(Some(&done), Some(false), 0);
        assert!(d.need_election && d.purge_existing);

        // Done + unmonitored: benefit of the doubt
        let d = ElectionDecision::evaluate(Some(&done), None, 0);
        assert!(!d.need_election);
    }

    #[tokio::test]
    async fn test_sole_candidate_wins_and_finalizes() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(0, 300_000));
        let candidate = vm("i-a", "primary-group");

        let outcome = runner(&platform, proxy, false).run(&candidate).await.unwrap();
        match outcome {
            ElectionOutcome::Elected(record) => {
                assert_eq!(record.vm_id, "i-a");
                assert_eq!(record.vote_state, VoteState::Done);
                assert_eq!(record.vote_end_time, 90_000);
            }
            other => panic!("expected Elected, got {:?}", other),
        }
        assert_eq!(
            platform.primary_record_now().unwrap().vote_state,
            VoteState::Done
        );
    }

    #[tokio::test]
    async fn test_follower_accepts_settled_record() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(0, 300_000));
        let incumbent = vm("i-a", "primary-group");
        let follower = vm("i-b", "payg-group");

        let record = PrimaryRecord::new_vote(&incumbent, 90_000);
        platform.create_primary_record(&record, None).await.unwrap();
        platform
            .update_primary_record(&record.finalized())
            .await
            .unwrap();
        platform
            .create_health_check_record(&HealthCheckRecord::first_heartbeat(
                "i-a",
                "primary-group",
                &incumbent.primary_private_ip,
                "",
                30,
                0,
            ))
            .await
            .unwrap();

        let outcome = runner(&platform, proxy, false).run(&follower).await.unwrap();
        match outcome {
            ElectionOutcome::Follower(r) => assert_eq!(r.vm_id, "i-a"),
            other => panic!("expected Follower, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_wait_returns_pending_vote() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(0, 300_000));
        let other = vm("i-a", "primary-group");
        let observer = vm("i-b", "primary-group");

        let pending = PrimaryRecord::new_vote(&other, 90_000);
        platform.create_primary_record(&pending, None).await.unwrap();

        let outcome = runner(&platform, proxy, true).run(&observer).await.unwrap();
        match outcome {
            ElectionOutcome::Pending(r) => assert_eq!(r.vm_id, "i-a"),
            other => panic!("expected Pending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unhealthy_incumbent_is_purged_and_replaced() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(200_000, 300_000));
        let incumbent = vm("i-a", "primary-group");
        let challenger = vm("i-b", "primary-group");
        platform.seed_vm(incumbent.clone());
        platform.seed_vm(challenger.clone());

        let record = PrimaryRecord::new_vote(&incumbent, 90_000);
        platform.create_primary_record(&record, None).await.unwrap();
        platform
            .update_primary_record(&record.finalized())
            .await
            .unwrap();
        // The incumbent went silent right after its first heartbeat at t=0
        platform
            .create_health_check_record(&HealthCheckRecord::first_heartbeat(
                "i-a",
                "primary-group",
                &incumbent.primary_private_ip,
                "",
                30,
                0,
            ))
            .await
            .unwrap();

        let outcome = runner(&platform, proxy, false)
            .run(&challenger)
            .await
            .unwrap();
        match outcome {
            ElectionOutcome::Elected(r) => assert_eq!(r.vm_id, "i-b"),
            other => panic!("expected Elected, got {:?}", other),
        }

        // The deposed incumbent left the cluster and its VM was terminated
        let deposed = platform.health_record_now("i-a").unwrap();
        assert_eq!(deposed.sync_state, SyncState::OutOfSync);
        assert!(!deposed.healthy);
        assert_eq!(platform.terminated_vms(), vec!["i-a".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_vote_is_replaced() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(100_000, 300_000));
        let stalled = vm("i-a", "primary-group");
        let challenger = vm("i-b", "primary-group");

        let pending = PrimaryRecord::new_vote(&stalled, 90_000);
        platform.create_primary_record(&pending, None).await.unwrap();

        let outcome = runner(&platform, proxy, false)
            .run(&challenger)
            .await
            .unwrap();
        match outcome {
            ElectionOutcome::Elected(r) => assert_eq!(r.vm_id, "i-b"),
            other => panic!("expected Elected, got {:?}", other),
        }
        // The stalled candidate was not terminated: it never held the role
        assert!(platform.terminated_vms().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_time_yields_timeout() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(0, EXECUTION_TIME_RESERVE_MS - 1));
        let candidate = vm("i-a", "primary-group");

        let outcome = runner(&platform, proxy, false).run(&candidate).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::TimedOut);
        assert!(platform.primary_record_now().is_none());
    }

    #[tokio::test]
    async fn test_own_pending_vote_is_finalized_on_reentry() {
        let platform = MemoryPlatformAdapter::new();
        let proxy = Arc::new(StaticProxy::new(10_000, 300_000));
        let candidate = vm("i-a", "primary-group");

        let pending = PrimaryRecord::new_vote(&candidate, 90_000);
        platform.create_primary_record(&pending, None).await.unwrap();

        let outcome = runner(&platform, proxy, false).run(&candidate).await.unwrap();
        match outcome {
            ElectionOutcome::Elected(r) => {
                assert_eq!(r.vm_id, "i-a");
                assert_eq!(r.vote_state, VoteState::Done);
            }
            other => panic!("expected Elected, got {:?}", other),
        }
    }
}
