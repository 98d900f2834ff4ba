use std::time::Duration;

use anyhow::anyhow;

/// Current wall-clock time as (fractional) seconds since the UNIX epoch.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub fn hours_to_secs(hours: f64) -> f64 {
    hours * 3600.0
}

/// Parses a job lifetime into hours.
/// Accepts either a plain number of hours (`1.5`) or a humantime duration (`90m`, `2h`).
pub fn parse_lifetime_hours(text: &str) -> anyhow::Result<f64> {
    let text = text.trim();
    let hours = match text.parse::<f64>() {
        Ok(hours) => hours,
        Err(_) => humantime::parse_duration(text)
            .map(|d| d.as_secs_f64() / 3600.0)
            .map_err(|e| {
                anyhow!("Could not parse job time. Use either hours (1.5) or humantime format (90m): {e:?}")
            })?,
    };
    if !hours.is_finite() || hours <= 0.0 {
        return Err(anyhow!("Job time has to be positive, got `{text}`"));
    }
    Ok(hours)
}

pub fn human_duration(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "0s".to_string();
    }
    // Truncate to reasonable precision
    let secs = seconds as u64;
    let truncated = if secs >= 3600 {
        secs - secs % 60
    } else {
        secs
    };
    humantime::format_duration(Duration::from_secs(truncated)).to_string()
}

#[cfg(test)]
mod tests {
    use crate::common::utils::time::{human_duration, parse_lifetime_hours};

    #[test]
    fn parse_plain_hours() {
        assert_eq!(parse_lifetime_hours("1").unwrap(), 1.0);
        assert_eq!(parse_lifetime_hours("0.5").unwrap(), 0.5);
    }

    #[test]
    fn parse_humantime() {
        assert_eq!(parse_lifetime_hours("90m").unwrap(), 1.5);
        assert_eq!(parse_lifetime_hours("2h").unwrap(), 2.0);
    }

    #[test]
    fn parse_invalid() {
        assert!(parse_lifetime_hours("").is_err());
        assert!(parse_lifetime_hours("-1").is_err());
        assert!(parse_lifetime_hours("0").is_err());
        assert!(parse_lifetime_hours("soon").is_err());
    }

    #[test]
    fn format_durations() {
        assert_eq!(human_duration(-5.0), "0s");
        assert_eq!(human_duration(42.7), "42s");
        assert_eq!(human_duration(3725.0), "1h 2m");
    }
}
