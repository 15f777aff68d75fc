//! Batches several commands into one write and collects the replies in
//! order.

use redmux::{Client, ClientOptions, Pipeline};

#[tokio::main]
async fn main() -> redmux::Result<()> {
    let client = Client::new(ClientOptions::default());
    let mut pipeline = Pipeline::new();
    pipeline.stack_call(vec!["SET".into(), "foo".into(), "bar".into()]);
    pipeline.stack_call(vec!["GET".into(), "foo".into()]);
    pipeline.stack_call(vec!["DEL".into(), "foo".into()]);
    let replies = client.call_pipeline(pipeline).await?;
    for (index, reply) in replies.iter().enumerate() {
        println!("reply #{}: {:?}", index, reply);
    }
    client.disconnect();
    Ok(())
}
