use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    parley_server::run().await
}
