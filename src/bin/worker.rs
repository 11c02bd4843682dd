#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = print_omr::run_worker().await {
        eprintln!("print-omr-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
