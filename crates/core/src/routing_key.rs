//! Daily-rotated routing keys for the network database.
//!
//! `routing_key(H) = SHA256(H || yyyymmdd)` with the date taken at UTC
//! midnight, so the whole keyspace shifts once a day and stale records
//! migrate between floodfills.

use sha2::{Digest, Sha256};

use crate::{now_secs, Hash};

/// Compute the routing key of `ident` for the UTC day containing
/// `unix_secs`.
pub fn routing_key(ident: &Hash, unix_secs: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(ident.as_bytes());
    hasher.update(date_bytes(unix_secs));
    Hash(hasher.finalize().into())
}

/// Caches the current day's date string and exposes rotation detection.
#[derive(Debug, Clone)]
pub struct RoutingKeyCalculator {
    day: u64,
}

impl RoutingKeyCalculator {
    pub fn new() -> Self {
        Self {
            day: now_secs() / 86_400,
        }
    }

    /// True once per UTC day boundary; callers re-index on rotation.
    pub fn check_rotation(&mut self) -> bool {
        let day = now_secs() / 86_400;
        if day != self.day {
            self.day = day;
            true
        } else {
            false
        }
    }

    pub fn key_for(&self, ident: &Hash) -> Hash {
        routing_key(ident, self.day * 86_400)
    }
}

impl Default for RoutingKeyCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// The 8 ASCII bytes `yyyymmdd` for the UTC day containing `unix_secs`.
fn date_bytes(unix_secs: u64) -> [u8; 8] {
    let (year, month, day) = civil_from_days((unix_secs / 86_400) as i64);
    let mut out = [0u8; 8];
    let s = format!("{year:04}{month:02}{day:02}");
    out.copy_from_slice(s.as_bytes());
    out
}

/// Gregorian date from days since the Unix epoch (Hinnant's civil algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_from_days_known_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1)); // 2024-01-01
        assert_eq!(civil_from_days(11_016), (2000, 2, 29)); // leap day
    }

    #[test]
    fn test_date_bytes_format() {
        // 2024-01-01 00:00:00 UTC
        assert_eq!(&date_bytes(1_704_067_200), b"20240101");
    }

    #[test]
    fn test_routing_key_rotates_daily() {
        let h = Hash::digest(b"router");
        let day1 = routing_key(&h, 1_704_067_200);
        let day2 = routing_key(&h, 1_704_067_200 + 86_400);
        let same_day = routing_key(&h, 1_704_067_200 + 3_600);
        assert_ne!(day1, day2);
        assert_eq!(day1, same_day);
    }

    #[test]
    fn test_routing_key_differs_per_ident() {
        let t = 1_704_067_200;
        assert_ne!(
            routing_key(&Hash::digest(b"a"), t),
            routing_key(&Hash::digest(b"b"), t)
        );
    }
}
