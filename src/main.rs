#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pos_sync_lib::run_server().await
}
