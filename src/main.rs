use meshroom::config::RelayConfig;
use meshroom::relay::RelayServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("meshroom=info".parse()?))
        .init();

    let config = RelayConfig::from_env();

    println!("   Meshroom Relay");
    println!("   Binding to {}", config.bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = RelayServer::bind(config).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\nShutting down"),
    }
    Ok(())
}
