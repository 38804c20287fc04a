#[tokio::main]
async fn main() -> anyhow::Result<()> {
    one_mcp::run().await
}
