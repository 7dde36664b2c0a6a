#[tokio::main]
async fn main() -> anyhow::Result<()> {
    proctorcam_lib::run().await
}
