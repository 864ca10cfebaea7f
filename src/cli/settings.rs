use crate::core::models::Priority;
use crate::core::settings::{ScheduleSettings, SettingsPatch};
use anyhow::Result;
use clap::Args;

/// Shows the schedule settings, or updates the fields given as flags.
#[derive(Debug, Default, Args)]
pub struct SettingsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Base refresh interval, in seconds
    #[arg(long)]
    pub base_interval: Option<u64>,

    /// Refresh interval inside peak windows, in seconds
    #[arg(long)]
    pub peak_interval: Option<u64>,

    /// Days of history kept for pattern analysis
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// Per-run deadline, in seconds
    #[arg(long)]
    pub max_run: Option<u64>,

    /// Priority passed to the data source (low, medium, high)
    #[arg(long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Send a desktop notification when a run fails
    #[arg(long)]
    pub notify_on_failure: Option<bool>,

    /// Retry failed runs with exponential backoff
    #[arg(long)]
    pub auto_retry: Option<bool>,
}

impl SettingsArgs {
    fn patch(&self) -> SettingsPatch {
        SettingsPatch {
            base_interval_secs: self.base_interval,
            peak_interval_secs: self.peak_interval,
            retention_days: self.retention_days,
            max_run_secs: self.max_run,
            priority: self.priority,
            notify_on_failure: self.notify_on_failure,
            auto_retry: self.auto_retry,
        }
    }
}

pub async fn run(args: SettingsArgs) -> Result<()> {
    let patch = args.patch();

    let settings: ScheduleSettings = if patch.is_empty() {
        super::call_json("GetSettings", &()).await?
    } else {
        let body = serde_json::to_string(&patch)?;
        super::call_json("UpdateSettings", &(body.as_str(),)).await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        print_text_output(&settings);
    }
    Ok(())
}

fn print_text_output(settings: &ScheduleSettings) {
    println!("  {:<18} {}s", "Base interval:", settings.base_interval_secs);
    println!("  {:<18} {}s", "Peak interval:", settings.peak_interval_secs);
    println!("  {:<18} {} days", "Retention:", settings.retention_days);
    println!("  {:<18} {}s", "Max run:", settings.max_run_secs);
    println!("  {:<18} {}", "Priority:", settings.priority.as_str());
    println!("  {:<18} {}", "Notify on failure:", settings.notify_on_failure);
    println!("  {:<18} {}", "Auto retry:", settings.auto_retry);
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "medium" => Ok(Priority::Medium),
        "high" => Ok(Priority::High),
        other => Err(format!("unknown priority '{other}', expected low, medium or high")),
    }
}
