// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Human-readable formatting of byte counts and durations.

use std::time::Duration;

const UNITS: [&str; 6] = ["bytes", "kB", "MB", "GB", "TB", "PB"];

/// Format a byte count with a binary-thousands unit.
pub fn bytes_to_str(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a duration as `2d 3h`, `3h 14m`, `14m 9s` or `9s`.
pub fn duration_to_str(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_str() {
        assert_eq!(bytes_to_str(512), "512 bytes");
        assert_eq!(bytes_to_str(2048), "2.0 kB");
        assert_eq!(bytes_to_str(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_duration_to_str() {
        assert_eq!(duration_to_str(Duration::from_secs(9)), "9s");
        assert_eq!(duration_to_str(Duration::from_secs(849)), "14m 9s");
        assert_eq!(duration_to_str(Duration::from_secs(11_640)), "3h 14m");
        assert_eq!(duration_to_str(Duration::from_secs(183_600)), "2d 3h");
    }
}
