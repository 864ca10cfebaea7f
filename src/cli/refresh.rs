use anyhow::Result;

pub async fn run() -> Result<()> {
    let run_id: u64 = super::call("TriggerRefresh", &()).await?;
    println!("Refresh #{run_id} started");
    Ok(())
}
