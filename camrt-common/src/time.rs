//! Exposure time conversion

/// Convert a nanosecond exposure value (as reported by sensor metadata) to whole milliseconds
///
/// Negative values are treated as zero; sub-millisecond exposures round up to 1ms
/// so that any non-zero exposure contributes to timeout budgets.
pub fn nanos_to_millis_ceil(nanos: i64) -> u64 {
    if nanos <= 0 {
        return 0;
    }
    (nanos as u64).div_ceil(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_to_millis_ceil() {
        assert_eq!(nanos_to_millis_ceil(0), 0);
        assert_eq!(nanos_to_millis_ceil(-5), 0);
        assert_eq!(nanos_to_millis_ceil(1), 1);
        assert_eq!(nanos_to_millis_ceil(33_333_333), 34);
        assert_eq!(nanos_to_millis_ceil(500_000_000), 500);
    }
}
