//! Dispatch Gateway - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatch_gateway::run().await
}
