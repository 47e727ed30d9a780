use chrono::{DateTime, Local, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize a serde-backed enum into its string name (e.g. SCREAMING_SNAKE_CASE).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// Inverse of [`serde_enum_name`].
pub fn parse_enum_name<T: DeserializeOwned>(name: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}

/// Wall-clock time of day in the host's local timezone.
pub fn local_time_of_day(now: DateTime<Utc>) -> NaiveTime {
    now.with_timezone(&Local).time()
}

/// Human-friendly duration for log lines and notification bodies.
pub fn describe_duration(d: TimeDelta) -> String {
    let mins = d.num_minutes();
    if mins < 1 {
        format!("{}s", d.num_seconds().max(0))
    } else if mins < 120 {
        format!("{}m", mins)
    } else {
        format!("{}h{:02}m", mins / 60, mins % 60)
    }
}
