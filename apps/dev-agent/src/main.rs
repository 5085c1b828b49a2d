use anyhow::Result;
use dev_agent::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .init();

    let config = AgentConfig::from_env()?;
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    dev_agent::serve(listener, config).await
}
