use crate::client::{Client, ClientOptions};
use crate::codec::{Argument, Reply};
use crate::errors::{Error, Result};
use log::debug;
use std::time::Duration;

fn confirmation_count(reply: &Reply) -> Option<i64> {
    reply.as_array().and_then(|items| items.get(2)).and_then(Reply::as_integer)
}

// a valid confirmation is [command, name, count]
fn confirmation_matches(command: &str, reply: &Reply) -> bool {
    let items = match reply.as_array() {
        Some(items) if items.len() == 3 => items,
        _ => return false,
    };
    match items[0].as_bytes() {
        Some(name) => name.eq_ignore_ascii_case(command.as_bytes()),
        None => false,
    }
}

/// Client variant locked to redis subscription mode.
///
/// Ordinary calls are not available here: a subscribed connection can
/// only issue pub/sub commands, and messages are consumed through
/// [`SubscribedClient::pop_message`].
pub struct SubscribedClient {
    client: Client,
}

impl SubscribedClient {
    pub fn new(opts: ClientOptions) -> SubscribedClient {
        SubscribedClient {
            client: Client::new(opts),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub fn disconnect(&self) {
        self.client.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// True while the client is in subscription mode.
    pub fn subscribed(&self) -> bool {
        self.client.is_subscribed()
    }

    pub fn last_change_delta(&self) -> Option<Duration> {
        self.client.last_change_delta()
    }

    /// Subscribes to a list of channels. All confirmations must match
    /// for the result to be `true`; on success the client enters
    /// subscription mode.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<bool> {
        self.do_subscribe("SUBSCRIBE", channels).await
    }

    /// Subscribes to a list of patterns.
    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<bool> {
        self.do_subscribe("PSUBSCRIBE", patterns).await
    }

    /// Unsubscribes from a list of channels. A confirmation reporting
    /// zero remaining subscriptions leaves subscription mode.
    pub async fn unsubscribe(&self, channels: &[&str]) -> Result<bool> {
        self.do_unsubscribe("UNSUBSCRIBE", channels).await
    }

    /// Unsubscribes from a list of patterns.
    pub async fn punsubscribe(&self, patterns: &[&str]) -> Result<bool> {
        self.do_unsubscribe("PUNSUBSCRIBE", patterns).await
    }

    async fn do_subscribe(&self, command: &str, names: &[&str]) -> Result<bool> {
        if names.is_empty() {
            return Ok(false);
        }
        let replies = self.confirmations(command, names).await?;
        for reply in &replies {
            if !confirmation_matches(command, reply) {
                return Ok(false);
            }
            match confirmation_count(reply) {
                Some(count) if count > 0 => {}
                _ => return Ok(false),
            }
        }
        debug!("subscribed via {} to {} name(s)", command, names.len());
        self.client.set_subscribed(true);
        Ok(true)
    }

    async fn do_unsubscribe(&self, command: &str, names: &[&str]) -> Result<bool> {
        if names.is_empty() {
            return Ok(false);
        }
        let replies = self.confirmations(command, names).await?;
        for reply in &replies {
            if !confirmation_matches(command, reply) {
                return Ok(false);
            }
            if confirmation_count(reply) == Some(0) {
                self.client.set_subscribed(false);
            }
        }
        Ok(true)
    }

    // one command, one confirmation per name
    async fn confirmations(&self, command: &str, names: &[&str]) -> Result<Vec<Reply>> {
        let mut args: Vec<Argument> = Vec::with_capacity(names.len() + 1);
        args.push(command.into());
        args.extend(names.iter().map(|name| Argument::from(*name)));
        self.client.call_multiple_replies(args, names.len()).await
    }

    /// Pops one pub/sub message, waiting up to `deadline` when none is
    /// queued (forever without a deadline). A timeout returns
    /// `Ok(None)`; a dropped connection is an error and the caller has
    /// to reconnect and re-subscribe.
    ///
    /// Plain messages have shape `[message, channel, payload]`; pattern
    /// matches have shape `[pmessage, pattern, channel, payload]`.
    pub async fn pop_message(&self, deadline: Option<Duration>) -> Result<Option<Reply>> {
        if !self.subscribed() {
            return Err(Error::client(
                "you must subscribe before using pop_message",
            ));
        }
        self.client.pop_reply(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::MockServer;
    use bytes::Bytes;

    fn element(reply: &Reply, index: usize) -> Bytes {
        reply.as_array().unwrap()[index]
            .as_bytes()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_pubsub_flow() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        let publisher = Client::new(server.client_options());
        subscriber.connect().await.unwrap();

        match subscriber.pop_message(None).await {
            Err(Error::Client(_)) => (),
            other => panic!("expected client error, got {:?}", other),
        }

        assert!(subscriber.subscribe(&["foo1", "foo2"]).await.unwrap());
        assert!(subscriber.subscribed());
        assert!(subscriber.psubscribe(&["bar1*", "bar2*"]).await.unwrap());

        for (channel, value) in &[
            ("null", "value0"),
            ("foo1", "value1"),
            ("foo2", "value2"),
            ("bar111", "value3"),
            ("bar222", "value4"),
        ] {
            publisher
                .call(vec!["PUBLISH".into(), (*channel).into(), (*value).into()])
                .await
                .unwrap();
        }

        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 2), Bytes::from_static(b"value1"));
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 2), Bytes::from_static(b"value2"));
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 3), Bytes::from_static(b"value3"));
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 3), Bytes::from_static(b"value4"));
        let msg = subscriber
            .pop_message(Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(msg.is_none());

        assert!(subscriber.unsubscribe(&["foo1"]).await.unwrap());
        publisher
            .call(vec!["PUBLISH".into(), "foo1".into(), "late".into()])
            .await
            .unwrap();
        let msg = subscriber
            .pop_message(Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(msg.is_none());

        assert!(subscriber.unsubscribe(&["foo2"]).await.unwrap());
        assert!(subscriber.punsubscribe(&["bar1*"]).await.unwrap());
        assert!(subscriber.punsubscribe(&["bar2*"]).await.unwrap());
        assert!(!subscriber.subscribed());
        subscriber.disconnect();
        publisher.disconnect();
    }

    #[tokio::test]
    async fn test_message_and_pmessage_shapes() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        let publisher = Client::new(server.client_options());
        assert!(subscriber.psubscribe(&["foo*"]).await.unwrap());
        assert!(subscriber.subscribe(&["bar"]).await.unwrap());

        publisher
            .call(vec!["PUBLISH".into(), "foo1".into(), "value1".into()])
            .await
            .unwrap();
        publisher
            .call(vec!["PUBLISH".into(), "bar".into(), "value2".into()])
            .await
            .unwrap();

        // pattern match: [pmessage, pattern, channel, payload]
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 0), Bytes::from_static(b"pmessage"));
        assert_eq!(element(&msg, 1), Bytes::from_static(b"foo*"));
        assert_eq!(element(&msg, 2), Bytes::from_static(b"foo1"));
        assert_eq!(element(&msg, 3), Bytes::from_static(b"value1"));
        // plain match: [message, channel, payload]
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 0), Bytes::from_static(b"message"));
        assert_eq!(element(&msg, 1), Bytes::from_static(b"bar"));
        assert_eq!(element(&msg, 2), Bytes::from_static(b"value2"));
    }

    #[tokio::test]
    async fn test_pop_message_wakes_up_on_late_message() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        let publisher = Client::new(server.client_options());
        assert!(subscriber.subscribe(&["chan"]).await.unwrap());
        let publishing = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            publisher
                .call(vec!["PUBLISH".into(), "chan".into(), "late".into()])
                .await
        });
        // the waiter is already parked on the condition when the
        // message lands
        let msg = subscriber
            .pop_message(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(element(&msg, 2), Bytes::from_static(b"late"));
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_subscribe_returns_false() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        subscriber.connect().await.unwrap();
        assert!(!subscriber.subscribe(&[]).await.unwrap());
        assert!(!subscriber.subscribed());
    }

    #[tokio::test]
    async fn test_plain_client_call_is_rejected_while_subscribed() {
        let server = MockServer::start().await;
        let client = Client::new(server.client_options());
        client.connect().await.unwrap();
        client.set_subscribed(true);
        match client.call(vec!["PING".into()]).await {
            Err(Error::Client(_)) => (),
            other => panic!("expected client error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resubscribe_after_connection_drop() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        let publisher = Client::new(server.client_options());
        assert!(subscriber.subscribe(&["chan"]).await.unwrap());
        publisher.call(vec!["KILLALL".into()]).await.ok();
        match subscriber.pop_message(Some(Duration::from_secs(5))).await {
            Err(Error::Connection(_)) => (),
            other => panic!("expected connection error, got {:?}", other),
        }
        // the subscription does not survive the drop: reconnect and
        // subscribe again
        subscriber.connect().await.unwrap();
        assert!(!subscriber.subscribed());
        assert!(subscriber.subscribe(&["chan"]).await.unwrap());
        publisher
            .call(vec!["PUBLISH".into(), "chan".into(), "again".into()])
            .await
            .unwrap();
        let msg = subscriber.pop_message(None).await.unwrap().unwrap();
        assert_eq!(element(&msg, 2), Bytes::from_static(b"again"));
    }

    #[tokio::test]
    async fn test_connection_drop_delivers_sentinel() {
        let server = MockServer::start().await;
        let subscriber = SubscribedClient::new(server.client_options());
        let killer = Client::new(server.client_options());
        assert!(subscriber.subscribe(&["chan"]).await.unwrap());
        killer.call(vec!["KILLALL".into()]).await.ok();
        match subscriber.pop_message(Some(Duration::from_secs(5))).await {
            Err(Error::Connection(_)) => (),
            other => panic!("expected connection error, got {:?}", other),
        }
    }
}
