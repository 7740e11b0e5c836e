/// Formats an elapsed duration as `SS`, `MM:SS` or `HH:MM:SS`, every field
/// zero-padded to two digits.
///
/// Fractional seconds are truncated. The input must be non-negative and
/// finite; other values are a caller bug (this panics in debug builds and
/// the output is unspecified in release builds).
pub fn format_time_from_seconds(seconds: f64) -> String {
    debug_assert!(
        seconds.is_finite() && seconds >= 0.0,
        "elapsed seconds must be non-negative, got {seconds}"
    );
    let seconds = seconds as u64;
    if seconds < 60 {
        format!("{seconds:02}")
    } else if seconds < 3600 {
        format!("{:02}:{:02}", seconds / 60, seconds % 60)
    } else {
        format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_only() {
        assert_eq!(format_time_from_seconds(45.0), "45");
        assert_eq!(format_time_from_seconds(7.9), "07");
        assert_eq!(format_time_from_seconds(0.0), "00");
    }

    #[test]
    fn test_minutes_and_seconds() {
        assert_eq!(format_time_from_seconds(125.0), "02:05");
        assert_eq!(format_time_from_seconds(60.0), "01:00");
        assert_eq!(format_time_from_seconds(3599.0), "59:59");
    }

    #[test]
    fn test_hours() {
        assert_eq!(format_time_from_seconds(3725.0), "01:02:05");
        assert_eq!(format_time_from_seconds(3600.0), "01:00:00");
        assert_eq!(format_time_from_seconds(360_000.0), "100:00:00");
    }
}
