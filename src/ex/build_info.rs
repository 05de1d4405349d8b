use chrono::{DateTime, Utc};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn build_host() -> &'static str {
    option_env!("EXORSUS_BUILD_HOST").unwrap_or("unknown")
}

/// Build time as seconds since the epoch, stamped by build.rs.
fn build_epoch() -> Option<i64> {
    option_env!("EXORSUS_BUILD_TIME")?.trim().parse().ok()
}

pub fn build_time_pretty() -> String {
    build_epoch()
        .and_then(format_epoch)
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_epoch(secs: i64) -> Option<String> {
    // Render in UTC, stable across environments.
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn banner() -> String {
    format!(
        "Exorsus {} (built on {} at {}).",
        version(),
        build_host(),
        build_time_pretty()
    )
}
