//! Subscribes to a channel and a pattern, publishes a few messages from
//! a second client, and drains them with pop_message.

use redmux::{Client, ClientOptions, SubscribedClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> redmux::Result<()> {
    let subscriber = SubscribedClient::new(ClientOptions::default());
    let publisher = Client::new(ClientOptions::default());

    if !subscriber.subscribe(&["news"]).await? {
        println!("subscribe refused");
        return Ok(());
    }
    if !subscriber.psubscribe(&["sport.*"]).await? {
        println!("psubscribe refused");
        return Ok(());
    }

    publisher
        .call(vec!["PUBLISH".into(), "news".into(), "headline".into()])
        .await?;
    publisher
        .call(vec!["PUBLISH".into(), "sport.tennis".into(), "score".into()])
        .await?;

    while let Some(message) = subscriber
        .pop_message(Some(Duration::from_secs(1)))
        .await?
    {
        println!("message: {:?}", message);
    }
    println!("no more messages");

    subscriber.unsubscribe(&["news"]).await?;
    subscriber.punsubscribe(&["sport.*"]).await?;
    subscriber.disconnect();
    publisher.disconnect();
    Ok(())
}
