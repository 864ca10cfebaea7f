use anyhow::Result;

pub async fn run() -> Result<()> {
    let () = super::call("Reenable", &()).await?;
    println!("Scheduler re-enabled; the next refresh runs now");
    Ok(())
}
