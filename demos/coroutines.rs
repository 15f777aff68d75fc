//! Minimal request/reply usage against a local redis server.

use redmux::{Client, ClientOptions};

#[tokio::main]
async fn main() -> redmux::Result<()> {
    let client = Client::new(ClientOptions::default());
    client.connect().await?;
    let reply = client
        .call(vec!["SET".into(), "hello".into(), "world".into()])
        .await?;
    println!("SET -> {:?}", reply);
    let reply = client.call(vec!["GET".into(), "hello".into()]).await?;
    println!("GET -> {:?}", reply);
    client.disconnect();
    Ok(())
}
