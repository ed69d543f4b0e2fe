use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mail_aggregator=info,tower_http=warn".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = mail_aggregator::run().await {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}
