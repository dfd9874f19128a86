// Headless Entry Point, Konfiguration über Umgebungsvariablen

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    call_app_lib::run().await
}
