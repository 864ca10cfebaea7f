use crate::core::models::{RefreshRecord, Status};
use anyhow::Result;
use chrono::{DateTime, Utc};

pub async fn run(json: bool) -> Result<()> {
    let status: Status = super::call_json("GetStatus", &()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_text_output(&status, Utc::now());
    }
    Ok(())
}

fn print_text_output(status: &Status, now: DateTime<Utc>) {
    println!("{}", status.source);
    println!("  {:<10} {}", "State:", status.state.name());

    if let Some(next) = status.next_run_at {
        println!("  {:<10} {} ({})", "Next run:", next.format("%Y-%m-%d %H:%M UTC"), format_due(next, now));
    }
    if let Some(id) = status.running_record_id {
        println!("  {:<10} #{}", "Running:", id);
    }
    if status.consecutive_failures > 0 {
        println!("  {:<10} {} consecutive", "Failures:", status.consecutive_failures);
    }
    if let Some(record) = &status.last_record {
        println!("  {:<10} {}", "Last run:", summarize(record));
    }

    if status.peak_windows.is_empty() {
        println!("  {:<10} none detected", "Peaks:");
    } else {
        let windows: Vec<String> = status.peak_windows.iter().map(|w| w.to_string()).collect();
        println!("  {:<10} {}", "Peaks:", windows.join(", "));
    }
}

pub(crate) fn summarize(record: &RefreshRecord) -> String {
    let mut line = format!(
        "#{} {} at {} ({}, {} tables, {} queries)",
        record.id,
        record.outcome.name(),
        record.started_at.format("%Y-%m-%d %H:%M"),
        format_duration_ms(record.duration_ms),
        record.tables_scanned,
        record.queries_analyzed,
    );
    if let Some(detail) = &record.error_detail {
        line.push_str(&format!(": {detail}"));
    }
    line
}

fn format_due(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = at.signed_duration_since(now);

    if duration.num_seconds() <= 0 {
        return "due now".to_string();
    }

    let total_minutes = duration.num_minutes();
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    if days > 0 {
        format!("in {}d {}h", days, hours)
    } else if hours > 0 {
        format!("in {}h {:02}m", hours, minutes)
    } else {
        format!("in {}m", minutes)
    }
}

pub(crate) fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m {:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}
