//! Basic OCI registry server
//!
//! Run with: cargo run -p ociserver --example basic_server

use ocimem::MemRegistry;
use ociserver::ServerBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // An empty in-memory registry backs the server.
    let app = ServerBuilder::new().registry(MemRegistry::new()).build();

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("OCI registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
