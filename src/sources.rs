//! `cw sources`: configured sources with their lifecycle status and health.

use chrono::{DateTime, Utc};

use casewatch_core::models::{DataSourceDescriptor, SourceHealthStatus};

use crate::scheduler::Scheduler;
use crate::stats::format_relative;

/// Print one row per source, most urgent first.
pub fn list_sources(scheduler: &Scheduler) {
    print!("{}", render_sources(&scheduler.sources(), Utc::now()));
}

pub fn render_sources(
    sources: &[(DataSourceDescriptor, SourceHealthStatus)],
    now: DateTime<Utc>,
) -> String {
    let mut rows: Vec<&(DataSourceDescriptor, SourceHealthStatus)> = sources.iter().collect();
    rows.sort_by(|(a, _), (b, _)| {
        a.schedule
            .priority
            .cmp(&b.schedule.priority)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut out = format!(
        "{:<20} {:<8} {:<9} {:<12} {:>8} {:>6} {:>7}   {}\n",
        "SOURCE", "KIND", "PRIORITY", "STATUS", "INTERVAL", "ERRORS", "HEALTHY", "LAST SUCCESS"
    );
    for (descriptor, health) in rows {
        let last = health
            .last_successful_sync
            .map(|ts| format_relative(ts, now))
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:<20} {:<8} {:<9} {:<12} {:>7}m {:>6} {:>7}   {}\n",
            descriptor.id,
            descriptor.kind.as_str(),
            descriptor.schedule.priority.as_str(),
            descriptor.status.as_str(),
            descriptor.schedule.interval_minutes,
            descriptor.error_count,
            if health.is_healthy { "yes" } else { "no" },
            last
        ));
        if let Some(err) = &health.last_error {
            out.push_str(&format!("{:<20} last error: {}\n", "", err));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use casewatch_core::models::{AdapterKind, Priority, RateLimit, Schedule, SourceStatus};

    fn source(id: &str, priority: Priority, status: SourceStatus) -> DataSourceDescriptor {
        DataSourceDescriptor {
            id: id.into(),
            name: id.into(),
            kind: AdapterKind::Rss,
            base_url: "https://example.org".into(),
            rate_limit: RateLimit {
                requests_per_minute: 30,
                burst: 5,
            },
            schedule: Schedule {
                interval_minutes: 15,
                priority,
            },
            status,
            error_count: 0,
        }
    }

    #[test]
    fn test_rows_sorted_by_priority() {
        let now = Utc::now();
        let mut failing = SourceHealthStatus::new("b_feed");
        failing.is_healthy = false;
        failing.last_error = Some("HTTP 503".into());
        let mut ok = SourceHealthStatus::new("a_feed");
        ok.last_successful_sync = Some(now - chrono::Duration::minutes(5));

        let rendered = render_sources(
            &[
                (source("a_feed", Priority::Low, SourceStatus::Active), ok),
                (source("b_feed", Priority::Critical, SourceStatus::Error), failing),
            ],
            now,
        );
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].starts_with("SOURCE"));
        assert!(lines[1].starts_with("b_feed"));
        assert!(lines[1].contains("error"));
        assert!(lines[2].contains("last error: HTTP 503"));
        assert!(lines[3].starts_with("a_feed"));
        assert!(lines[3].contains("5 mins ago"));
    }
}
