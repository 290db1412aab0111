use chrono::{DateTime, Utc};
use loopwatch_protocol::SYNTHETIC_ID_FLOOR;

/// Generator for ids of live (not yet persisted) events.
///
/// The base is fixed from the wall clock at construction and sits above
/// [`SYNTHETIC_ID_FLOOR`], so generated ids never collide with persisted
/// ones. The counter makes ids unique within this generator even when many
/// events arrive in the same millisecond.
#[derive(Debug, Clone)]
pub struct SyntheticIds {
    base: u64,
    issued: u64,
}

impl SyntheticIds {
    pub fn new() -> Self {
        Self::with_base(base_from_clock(Utc::now()))
    }

    pub fn with_base(base: u64) -> Self {
        Self {
            base: base.max(SYNTHETIC_ID_FLOOR),
            issued: 0,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.base.saturating_add(self.issued);
        self.issued = self.issued.saturating_add(1);
        id
    }
}

impl Default for SyntheticIds {
    fn default() -> Self {
        Self::new()
    }
}

fn base_from_clock(now: DateTime<Utc>) -> u64 {
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
    SYNTHETIC_ID_FLOOR.saturating_add(millis.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwatch_protocol::is_synthetic_id;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_above_floor() {
        let mut ids = SyntheticIds::new();
        let issued: HashSet<u64> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(issued.len(), 10_000);
        assert!(issued.iter().all(|id| is_synthetic_id(*id)));
    }

    #[test]
    fn small_base_is_lifted_to_floor() {
        let mut ids = SyntheticIds::with_base(5);
        assert_eq!(ids.next_id(), SYNTHETIC_ID_FLOOR);
        assert_eq!(ids.next_id(), SYNTHETIC_ID_FLOOR + 1);
    }

    #[test]
    fn later_clock_gives_larger_base() {
        let earlier = DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2026-01-31T00:00:00.001Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        assert_eq!(base_from_clock(later) - base_from_clock(earlier), 1000);
    }
}
