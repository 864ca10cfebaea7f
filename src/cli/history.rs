use crate::core::models::{Outcome, RefreshRecord};
use anyhow::Result;

pub async fn run(json: bool, hours: u32) -> Result<()> {
    let records: Vec<RefreshRecord> = super::call_json("GetHistory", &(hours,)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No refresh runs in the last {hours}h");
        return Ok(());
    }

    for record in &records {
        println!("  {} [{}]", super::status::summarize(record), record.reason.name());
    }

    let (completed, failed) = tally(&records);
    println!();
    println!("  {} runs, {} completed, {} failed", records.len(), completed, failed);
    Ok(())
}

fn tally(records: &[RefreshRecord]) -> (usize, usize) {
    let completed = records.iter().filter(|r| r.outcome.is_completed()).count();
    let failed = records
        .iter()
        .filter(|r| r.outcome == Outcome::Failure)
        .count();
    (completed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::RunReason;
    use chrono::Utc;

    #[test]
    fn test_tally_skips_pending() {
        let mut records: Vec<RefreshRecord> = (1..=4)
            .map(|id| RefreshRecord::pending(id, Utc::now(), RunReason::Scheduled))
            .collect();
        records[0].outcome = Outcome::Success;
        records[1].outcome = Outcome::Warning;
        records[2].outcome = Outcome::Failure;

        assert_eq!(tally(&records), (2, 1));
    }
}
