// src/date.rs
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-second cache of the RFC 7231 fixed-format `Date` value (29 bytes).
/// The event loop refreshes it at most once per poll cycle; every response
/// serialized within the same second reuses the formatted bytes.
pub struct DateCache {
    epoch_secs: u64,
    line: [u8; 29],
}

impl DateCache {
    pub fn new() -> Self {
        let mut cache = Self {
            epoch_secs: u64::MAX,
            line: [0; 29],
        };
        cache.refresh(SystemTime::now());
        cache
    }

    /// Re-format only when the wall-clock second changed.
    pub fn refresh(&mut self, now: SystemTime) {
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if secs == self.epoch_secs {
            return;
        }
        let formatted = httpdate::fmt_http_date(now);
        debug_assert_eq!(formatted.len(), 29);
        self.line.copy_from_slice(formatted.as_bytes());
        self.epoch_secs = secs;
    }

    #[inline]
    pub fn bytes(&self) -> &[u8; 29] {
        &self.line
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_date_is_29_bytes_gmt() {
        let cache = DateCache::new();
        let s = std::str::from_utf8(cache.bytes()).unwrap();
        assert_eq!(s.len(), 29);
        assert!(s.ends_with(" GMT"));
    }

    #[test]
    fn test_refresh_same_second_is_stable() {
        let mut cache = DateCache::new();
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        cache.refresh(t);
        let first = *cache.bytes();
        cache.refresh(t + Duration::from_millis(400));
        assert_eq!(first, *cache.bytes());
        cache.refresh(t + Duration::from_secs(1));
        assert_ne!(first, *cache.bytes());
    }
}
