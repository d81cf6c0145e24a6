#[tokio::main]
async fn main() {
    lead_chat_server::app::run().await;
}
