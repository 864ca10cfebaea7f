use crate::core::models::RefreshRecord;
use anyhow::Result;
use notify_rust::Notification;

/// Receives failed-run events when `notify_on_failure` is set.
pub trait Notifier: Send + Sync {
    fn refresh_failed(&self, source: &str, record: &RefreshRecord, consecutive_failures: u32, disabled: bool);
}

/// Desktop notifications over the freedesktop notification service.
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn refresh_failed(&self, source: &str, record: &RefreshRecord, consecutive_failures: u32, disabled: bool) {
        let summary = if disabled {
            format!("{source} refresh disabled")
        } else {
            format!("{source} refresh failed")
        };
        let detail = record.error_detail.as_deref().unwrap_or("unknown error");
        let body = if disabled {
            format!(
                "Run #{} failed ({detail}). Scheduling stopped after {consecutive_failures} consecutive failures; run `freshet reenable` to resume.",
                record.id
            )
        } else {
            format!(
                "Run #{} failed ({detail}). {consecutive_failures} consecutive failure(s).",
                record.id
            )
        };

        // notify-rust blocks on the session bus round-trip.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = send_notification(&summary, &body) {
                tracing::warn!(error = %e, "Failed to send failure notification");
            }
        });
    }
}

fn send_notification(summary: &str, body: &str) -> Result<()> {
    Notification::new()
        .summary(summary)
        .body(body)
        .appname("freshet")
        .timeout(notify_rust::Timeout::Milliseconds(8000))
        .show()?;

    tracing::info!(summary, "Sent failure notification");
    Ok(())
}
