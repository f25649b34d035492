mod host;
mod meter;
mod outputs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
