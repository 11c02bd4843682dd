#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = print_omr::run().await {
        eprintln!("print-omr fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
