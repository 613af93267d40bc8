use minecraft_raknet_proxy::{events::EventBus, Handler};
use std::{net::SocketAddr, sync::Arc};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let bind_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:19132".to_owned())
        .parse()?;
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:19134".to_owned())
        .parse()?;

    let mut handler = Handler::bind(bind_addr, server_addr, Arc::new(EventBus::new())).await?;
    tracing::info!("listening on {bind_addr}, proxying to {server_addr}");

    handler.run().await
}
