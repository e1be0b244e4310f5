//! TTL gate in front of acquisition.

use chrono::{DateTime, Duration, Utc};
use lbof_core::CityNiche;
use lbof_storage::CacheLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Skip { last_success_at: DateTime<Utc> },
    Proceed,
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessGate {
    ttl: Duration,
}

impl FreshnessGate {
    pub fn new(ttl_days: u32) -> Self {
        Self {
            ttl: Duration::days(i64::from(ttl_days)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A success stamped in the future (clock skew) still counts as fresh.
    pub fn decide(&self, ledger: &CacheLedger, key: &CityNiche, now: DateTime<Utc>) -> GateDecision {
        match ledger.last_success(key) {
            Some(last_success_at) if now - last_success_at < self.ttl => {
                GateDecision::Skip { last_success_at }
            }
            _ => GateDecision::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn fresh_entries_skip_and_stale_entries_proceed() {
        let dir = tempdir().expect("tempdir");
        let key = CityNiche::new("Contagem", "pet shop");
        let mut ledger = CacheLedger::open(dir.path()).await.expect("ledger");
        let gate = FreshnessGate::new(7);

        assert_eq!(gate.decide(&ledger, &key, at(10)), GateDecision::Proceed);

        ledger.record_success(&key, at(1)).await.expect("record");
        assert_eq!(
            gate.decide(&ledger, &key, at(7)),
            GateDecision::Skip { last_success_at: at(1) }
        );
        assert_eq!(gate.decide(&ledger, &key, at(8)), GateDecision::Proceed);
        assert_eq!(gate.decide(&ledger, &key, at(20)), GateDecision::Proceed);
    }

    #[tokio::test]
    async fn zero_ttl_never_skips() {
        let dir = tempdir().expect("tempdir");
        let key = CityNiche::new("Contagem", "pet shop");
        let mut ledger = CacheLedger::open(dir.path()).await.expect("ledger");
        ledger.record_success(&key, at(5)).await.expect("record");
        assert_eq!(FreshnessGate::new(0).decide(&ledger, &key, at(5)), GateDecision::Proceed);
    }
}
