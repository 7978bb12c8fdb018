use log::info;
use websock::start_server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(9000);

    let server = start_server(port).await?;
    info!(
        "echo server running on ws://{}/echo - press Ctrl-C to stop",
        server.local_addr()
    );

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;

    Ok(())
}
