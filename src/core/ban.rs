// src/core/ban.rs

//! Accumulates "culprit credits" against misbehaving nodes and triggers
//! timed bans when a threshold is crossed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::core::model::Pnn;

#[derive(Debug, Clone, Copy, Default)]
struct BanRecord {
    credits: u32,
    last_report: Option<Instant>,
    banned_until: Option<Instant>,
    /// Whether this node was banned as of the previous sweep, to detect the
    /// unban transition (ban expiring between two sweeps).
    was_banned: bool,
}

/// Per-node ban bookkeeping, local to this coordinator's view of the cluster.
#[derive(Debug, Default)]
pub struct BanBookkeeper {
    records: HashMap<Pnn, BanRecord>,
    grace_period: Duration,
    ban_period: Duration,
}

/// Outcome of a [`BanBookkeeper::sweep`].
#[derive(Debug, Default)]
pub struct SweepResult {
    /// Nodes newly banned by this sweep.
    pub newly_banned: Vec<Pnn>,
    /// Nodes whose ban expired as of this sweep; a node's `priority_time`
    /// must be reset on this transition so it cannot reclaim master on the
    /// strength of a counter it accrued while banned.
    pub newly_unbanned: Vec<Pnn>,
    /// Whether the local node is currently banned, independent of whether
    /// this specific sweep is what crossed the threshold.
    pub self_banned: bool,
}

impl BanBookkeeper {
    pub fn new(grace_period: Duration, ban_period: Duration) -> Self {
        Self {
            records: HashMap::new(),
            grace_period,
            ban_period,
        }
    }

    /// Adds `n` credits against `pnn`. No-op if `local_is_inactive` — a
    /// banned or otherwise inactive node must not ban peers.
    pub fn assign_credits(&mut self, pnn: Pnn, n: u32, local_is_inactive: bool) {
        if local_is_inactive {
            return;
        }
        let now = Instant::now();
        let rec = self.records.entry(pnn).or_default();
        if let Some(last) = rec.last_report
            && now.duration_since(last) > self.grace_period
        {
            rec.credits = 0;
        }
        rec.credits = rec.credits.saturating_add(n);
        rec.last_report = Some(now);
        warn!(pnn, credits = rec.credits, n, "assigned ban credits");
    }

    pub fn credits(&self, pnn: Pnn) -> u32 {
        self.records.get(&pnn).map(|r| r.credits).unwrap_or(0)
    }

    pub fn is_banned(&self, pnn: Pnn) -> bool {
        self.records
            .get(&pnn)
            .and_then(|r| r.banned_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Clears credits for every node ("forgive past sins"), run on a
    /// successful recovery settle.
    pub fn forgive_all(&mut self) {
        for rec in self.records.values_mut() {
            rec.credits = 0;
        }
    }

    /// Runs each monitor iteration before recovery decisions. Any node whose
    /// credits reach `2 * node_count` is banned for `ban_period` seconds and
    /// its credits reset. Also detects bans that have just expired, so the
    /// caller can reset the affected node's `priority_time`.
    pub fn sweep(&mut self, local_pnn: Pnn, node_count: usize) -> SweepResult {
        let threshold = 2 * node_count as u32;
        let mut result = SweepResult::default();
        let now = Instant::now();
        for (&pnn, rec) in self.records.iter_mut() {
            if threshold > 0 && rec.credits >= threshold {
                rec.banned_until = Some(now + self.ban_period);
                rec.credits = 0;
                result.newly_banned.push(pnn);
                info!(pnn, ban_seconds = self.ban_period.as_secs(), "node banned");
            }

            let currently_banned = rec.banned_until.is_some_and(|until| now < until);
            if rec.was_banned && !currently_banned {
                result.newly_unbanned.push(pnn);
                info!(pnn, "node ban expired");
            }
            rec.was_banned = currently_banned;

            if pnn == local_pnn && currently_banned {
                result.self_banned = true;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_accumulate_and_trigger_ban() {
        let mut bb = BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30));
        bb.assign_credits(5, 3, false);
        bb.assign_credits(5, 1, false);
        assert_eq!(bb.credits(5), 4);
        let result = bb.sweep(0, 2); // threshold = 4
        assert_eq!(result.newly_banned, vec![5]);
        assert!(!result.self_banned);
        assert_eq!(bb.credits(5), 0);
        assert!(bb.is_banned(5));
    }

    #[test]
    fn self_ban_is_observable() {
        let mut bb = BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30));
        bb.assign_credits(0, 10, false);
        let result = bb.sweep(0, 2);
        assert!(result.self_banned);
    }

    #[test]
    fn inactive_local_node_cannot_ban_peers() {
        let mut bb = BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30));
        bb.assign_credits(5, 100, true);
        assert_eq!(bb.credits(5), 0);
    }

    #[test]
    fn grace_period_resets_stale_credits() {
        let mut bb = BanBookkeeper::new(Duration::from_millis(10), Duration::from_secs(30));
        bb.assign_credits(5, 3, false);
        std::thread::sleep(Duration::from_millis(20));
        bb.assign_credits(5, 1, false);
        assert_eq!(bb.credits(5), 1);
    }

    #[test]
    fn unban_is_reported_when_ban_expires() {
        let mut bb = BanBookkeeper::new(Duration::from_secs(60), Duration::from_millis(10));
        bb.assign_credits(5, 10, false);
        let result = bb.sweep(0, 2); // threshold = 4
        assert_eq!(result.newly_banned, vec![5]);
        assert!(result.newly_unbanned.is_empty());
        std::thread::sleep(Duration::from_millis(20));
        let result = bb.sweep(0, 2);
        assert_eq!(result.newly_unbanned, vec![5]);
    }

    #[test]
    fn forgive_all_clears_credits() {
        let mut bb = BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30));
        bb.assign_credits(1, 3, false);
        bb.assign_credits(2, 5, false);
        bb.forgive_all();
        assert_eq!(bb.credits(1), 0);
        assert_eq!(bb.credits(2), 0);
    }
}
