use std::time::Duration;

use serde::{Deserialize, Serialize};
use snap_utils::PollPolicy;

/// Poll intervals, budgets and fixed waits, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub job_poll_secs: u64,
    pub job_poll_attempts: u32,
    /// Re-polls after an array operation completed, until the metadata store
    /// reflects it.
    pub post_op_poll_secs: u64,
    pub post_op_poll_cycles: u32,
    pub post_op_settle_secs: u64,
    pub phase_poll_secs: u64,
    pub phase_poll_attempts: u32,
    /// Budget a phase wait is extended to while the job is still running.
    pub phase_poll_extended_attempts: u32,
    pub suspend_poll_secs: u64,
    pub suspend_poll_attempts: u32,
    pub resume_poll_secs: u64,
    pub resume_poll_attempts: u32,
    pub suspend_dwell_secs: u64,
    pub aux_copy_suspend_cycles: u32,
    pub aging_retry_secs: u64,
    pub aging_retry_attempts: u32,
    pub pruning_poll_secs: u64,
    pub pruning_poll_attempts: u32,
    pub delete_poll_secs: u64,
    pub delete_poll_attempts: u32,
    pub reconcile_pause_secs: u64,
    pub backup_copy_discovery_secs: u64,
    pub backup_copy_discovery_attempts: u32,
    pub scenario_deadline_secs: Option<u64>,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            job_poll_secs: 30,
            job_poll_attempts: 480,
            post_op_poll_secs: 30,
            post_op_poll_cycles: 10,
            post_op_settle_secs: 30,
            phase_poll_secs: 10,
            phase_poll_attempts: 180,
            phase_poll_extended_attempts: 270,
            suspend_poll_secs: 20,
            suspend_poll_attempts: 30,
            resume_poll_secs: 10,
            resume_poll_attempts: 30,
            suspend_dwell_secs: 60,
            aux_copy_suspend_cycles: 3,
            aging_retry_secs: 60,
            aging_retry_attempts: 10,
            pruning_poll_secs: 120,
            pruning_poll_attempts: 20,
            delete_poll_secs: 120,
            delete_poll_attempts: 20,
            reconcile_pause_secs: 40,
            backup_copy_discovery_secs: 10,
            backup_copy_discovery_attempts: 10,
            scenario_deadline_secs: None,
        }
    }
}

fn policy(secs: u64, attempts: u32) -> PollPolicy {
    PollPolicy::new(Duration::from_secs(secs), attempts)
}

impl TimingSettings {
    pub fn job_poll(&self) -> PollPolicy {
        policy(self.job_poll_secs, self.job_poll_attempts)
    }

    pub fn post_op_poll(&self) -> PollPolicy {
        policy(self.post_op_poll_secs, self.post_op_poll_cycles)
    }

    pub fn post_op_settle(&self) -> Duration {
        Duration::from_secs(self.post_op_settle_secs)
    }

    pub fn phase_poll(&self) -> PollPolicy {
        policy(self.phase_poll_secs, self.phase_poll_attempts)
    }

    pub fn suspend_poll(&self) -> PollPolicy {
        policy(self.suspend_poll_secs, self.suspend_poll_attempts)
    }

    pub fn resume_poll(&self) -> PollPolicy {
        policy(self.resume_poll_secs, self.resume_poll_attempts)
    }

    pub fn suspend_dwell(&self) -> Duration {
        Duration::from_secs(self.suspend_dwell_secs)
    }

    pub fn aging_retry(&self) -> PollPolicy {
        policy(self.aging_retry_secs, self.aging_retry_attempts)
    }

    pub fn pruning_poll(&self) -> PollPolicy {
        policy(self.pruning_poll_secs, self.pruning_poll_attempts)
    }

    pub fn delete_poll(&self) -> PollPolicy {
        policy(self.delete_poll_secs, self.delete_poll_attempts)
    }

    pub fn reconcile_pause(&self) -> Duration {
        Duration::from_secs(self.reconcile_pause_secs)
    }

    pub fn backup_copy_discovery(&self) -> PollPolicy {
        policy(
            self.backup_copy_discovery_secs,
            self.backup_copy_discovery_attempts,
        )
    }

    pub fn scenario_deadline(&self) -> Option<Duration> {
        self.scenario_deadline_secs.map(Duration::from_secs)
    }

    /// Every poll budget, for validation.
    pub fn poll_budgets(&self) -> [(&'static str, u32); 9] {
        [
            ("job_poll_attempts", self.job_poll_attempts),
            ("post_op_poll_cycles", self.post_op_poll_cycles),
            ("phase_poll_attempts", self.phase_poll_attempts),
            ("suspend_poll_attempts", self.suspend_poll_attempts),
            ("resume_poll_attempts", self.resume_poll_attempts),
            ("aging_retry_attempts", self.aging_retry_attempts),
            ("pruning_poll_attempts", self.pruning_poll_attempts),
            ("delete_poll_attempts", self.delete_poll_attempts),
            (
                "backup_copy_discovery_attempts",
                self.backup_copy_discovery_attempts,
            ),
        ]
    }
}

/// Which copy a mirror's aging validation runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorAgingTarget {
    /// Retention and aging go to the mirror's source copy. Mirrors inherit
    /// prune eligibility from it.
    #[default]
    Source,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingSettings {
    pub mirror_target: MirrorAgingTarget,
    /// Trailing jobs one retained cycle keeps.
    pub jobs_per_cycle: usize,
}

impl Default for AgingSettings {
    fn default() -> Self {
        Self {
            mirror_target: MirrorAgingTarget::Source,
            jobs_per_cycle: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TimingSettings;

    #[test]
    fn test_default_ceilings() {
        let timings = TimingSettings::default();
        assert_eq!(timings.pruning_poll().ceiling(), Duration::from_secs(38 * 60));
        assert_eq!(timings.suspend_poll().interval, Duration::from_secs(20));
        assert_eq!(timings.phase_poll().max_attempts, 180);
        assert!(timings.poll_budgets().iter().all(|(_, n)| *n > 0));
    }
}
