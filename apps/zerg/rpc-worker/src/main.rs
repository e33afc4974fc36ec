//! RPC Worker Service - Entry Point
//!
//! Consumes order and ping requests from RabbitMQ and replies to them.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_rpc_worker::run().await
}
