#[tokio::main]
async fn main() {
    wa_chat_server::app::run().await;
}
