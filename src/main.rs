use pryx::cli;

#[tokio::main]
async fn main() {
    let filter = match std::env::var("PRYX_LOG_LEVEL") {
        Ok(level) if !level.is_empty() => tracing_subscriber::EnvFilter::new(level),
        _ => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::process::exit(cli::run().await);
}
