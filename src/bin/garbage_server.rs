use anyhow::Result;
use downspeed::garbage::{GarbageServer, MIB};
use std::net::SocketAddr;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("downspeed=info,garbage_server=info")
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = GarbageServer::bind(addr, MIB).await?;
    info!("Garbage server listening on port {}", port);

    server.run().await
}
