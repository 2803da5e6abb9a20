//! Sliding-window ban policy.
//!
//! Uses the fail2ban jail options terminology: an address is banned once
//! `max_retry` infractions fall within `find_time`, and stays banned for
//! `ban_time` after the most recent infraction that completed such a run.
//!
//! All functions expect timestamps in arrival order.

use chrono::{DateTime, Duration, Utc};

/// Ban thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JailPolicy {
    pub max_retry: usize,
    pub find_time: Duration,
    pub ban_time: Duration,
}

impl Default for JailPolicy {
    fn default() -> Self {
        Self::new(3, 600, 1800)
    }
}

impl JailPolicy {
    /// Durations beyond what a timestamp can hold saturate.
    pub fn new(max_retry: usize, find_time_seconds: u64, ban_time_seconds: u64) -> Self {
        Self {
            max_retry,
            find_time: seconds(find_time_seconds),
            ban_time: seconds(ban_time_seconds),
        }
    }

    /// An infraction counts only while strictly younger than `find_time`.
    pub fn in_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - at < self.find_time
    }

    /// Index of the first infraction still inside the window.
    pub fn window_start(&self, infractions: &[DateTime<Utc>], now: DateTime<Utc>) -> usize {
        infractions.partition_point(|at| !self.in_window(*at, now))
    }

    /// Number of infractions inside the window ending at `now`.
    pub fn count_in_window(&self, infractions: &[DateTime<Utc>], now: DateTime<Utc>) -> usize {
        infractions.len() - self.window_start(infractions, now)
    }

    /// Index of the most recent infraction that completed `max_retry`
    /// infractions within `find_time`.
    pub fn last_qualifying(&self, infractions: &[DateTime<Utc>]) -> Option<usize> {
        if self.max_retry == 0 || infractions.len() < self.max_retry {
            return None;
        }
        (self.max_retry - 1..infractions.len())
            .rev()
            .find(|&j| self.in_window(infractions[j + 1 - self.max_retry], infractions[j]))
    }

    /// Evaluate a record at `now`.
    pub fn evaluate(&self, infractions: &[DateTime<Utc>], now: DateTime<Utc>) -> Verdict {
        let mut keep_from = self.window_start(infractions, now);
        let mut banned_until = None;

        if let Some(j) = self.last_qualifying(infractions) {
            let until = infractions[j]
                .checked_add_signed(self.ban_time)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < until {
                // keep the run that justifies the ban until it expires
                keep_from = keep_from.min(j + 1 - self.max_retry);
            }
            banned_until = Some(until);
        }

        Verdict {
            banned_until,
            keep_from,
            len: infractions.len(),
        }
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Outcome of evaluating one infraction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// End of the most recent ban the record justifies, expired or not.
    pub banned_until: Option<DateTime<Utc>>,
    /// Entries before this index may be discarded.
    pub keep_from: usize,
    len: usize,
}

impl Verdict {
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    /// Nothing in the record is worth keeping.
    pub fn is_idle(&self) -> bool {
        self.keep_from >= self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn record(seconds: &[i64]) -> Vec<DateTime<Utc>> {
        seconds.iter().map(|s| at(*s)).collect()
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let policy = JailPolicy::default();
        assert!(policy.in_window(at(1), at(600)));
        assert!(!policy.in_window(at(0), at(600)));
        assert!(!policy.in_window(at(0), at(601)));
    }

    #[test]
    fn test_count_in_window() {
        let policy = JailPolicy::default();
        let infractions = record(&[0, 700, 710]);
        assert_eq!(policy.window_start(&infractions, at(710)), 1);
        assert_eq!(policy.count_in_window(&infractions, at(710)), 2);
        assert_eq!(policy.count_in_window(&infractions, at(2000)), 0);
        assert_eq!(policy.count_in_window(&[], at(0)), 0);
    }

    #[test]
    fn test_last_qualifying() {
        let policy = JailPolicy::default();
        assert_eq!(policy.last_qualifying(&record(&[0, 5])), None);
        assert_eq!(policy.last_qualifying(&record(&[0, 5, 10])), Some(2));
        assert_eq!(policy.last_qualifying(&record(&[0, 700, 710])), None);
        // exactly find_time apart does not qualify
        assert_eq!(policy.last_qualifying(&record(&[0, 300, 600])), None);
        assert_eq!(policy.last_qualifying(&record(&[0, 5, 10, 900])), Some(2));
        assert_eq!(policy.last_qualifying(&record(&[0, 5, 10, 15])), Some(3));
    }

    #[test]
    fn test_single_retry_policy() {
        let policy = JailPolicy::new(1, 600, 1800);
        assert_eq!(policy.last_qualifying(&record(&[0])), Some(0));
        assert!(policy.evaluate(&record(&[0]), at(10)).is_banned(at(10)));
    }

    #[test]
    fn test_evaluate_keeps_evidence_while_banned() {
        let policy = JailPolicy::default();
        let infractions = record(&[0, 5, 10]);

        let verdict = policy.evaluate(&infractions, at(700));
        assert!(verdict.is_banned(at(700)));
        assert_eq!(verdict.banned_until, Some(at(1810)));
        assert_eq!(verdict.keep_from, 0);
        assert!(!verdict.is_idle());

        let verdict = policy.evaluate(&infractions, at(1910));
        assert!(!verdict.is_banned(at(1910)));
        assert_eq!(verdict.keep_from, 3);
        assert!(verdict.is_idle());
    }

    #[test]
    fn test_evaluate_prunes_stale_entries_before_the_run() {
        let policy = JailPolicy::default();
        let infractions = record(&[-5000, 0, 5, 10, 1000]);

        let verdict = policy.evaluate(&infractions, at(1100));
        assert!(verdict.is_banned(at(1100)));
        assert_eq!(verdict.keep_from, 1);
    }

    #[test]
    fn test_huge_ban_time_saturates() {
        let policy = JailPolicy::new(3, u64::MAX, 10_000_000_000_000);
        assert_eq!(policy.find_time, Duration::MAX);

        let infractions = record(&[0, 0, 0]);
        let verdict = policy.evaluate(&infractions, at(0));
        assert!(verdict.is_banned(at(0)));
        assert_eq!(verdict.banned_until, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(policy.count_in_window(&infractions, at(1_000_000)), 3);
    }

    #[test]
    fn test_evaluate_unbanned_record() {
        let policy = JailPolicy::default();
        let infractions = record(&[0, 700]);

        let verdict = policy.evaluate(&infractions, at(710));
        assert_eq!(verdict.banned_until, None);
        assert!(!verdict.is_banned(at(710)));
        assert_eq!(verdict.keep_from, 1);
    }
}
