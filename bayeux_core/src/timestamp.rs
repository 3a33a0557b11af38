//! Timestamps

/// A wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampMillis(u64);

impl TimestampMillis {
    /// Create a new timestamp from milliseconds since Unix epoch.
    #[must_use]
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current timestamp.
    ///
    /// A system clock set before the Unix epoch reads as the epoch itself.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self(millis)
    }

    /// Get the raw milliseconds value.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Compute the signed difference (self - other) in milliseconds.
    #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
    #[must_use]
    pub const fn signed_diff(&self, other: Self) -> i64 {
        (self.0 as i128 - other.0 as i128) as i64
    }
}
