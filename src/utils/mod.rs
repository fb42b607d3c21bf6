/// Small helpers shared by the router, the harness and the CLI
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::Endpoint;
use crate::error::RouterResult;

/// Unique id made of a prefix, the wall-clock millis and a random suffix
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Parse a comma separated host list such as `tcp://a:8529, b:8530`
pub fn parse_host_list(input: &str) -> RouterResult<Vec<Endpoint>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Endpoint::parse)
        .collect()
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
