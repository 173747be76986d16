#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = gpuwarden_core_lib::run().await {
        eprintln!("gpuwarden: {err}");
        std::process::exit(1);
    }
}
