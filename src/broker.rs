//! Broker session abstraction: connect/reconnect, publish, subscribe,
//! receive, last-will — modeled as the fakeable capability interface named
//! in the design notes (`{Connect, Disconnect, Publish, Subscribe, Messages}`).

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::BrokerError;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// A single inbound message: `(topic, payload)`.
pub type Message = (String, Vec<u8>);

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), BrokerError>;
    async fn subscribe(&self, pattern: &str) -> Result<(), BrokerError>;
    /// Pulls the next inbound message. Callers race this against a
    /// cancellation signal with `tokio::select!` — cancellation is the
    /// caller's concern, not this method's; this method only reports
    /// genuine receive failures.
    async fn next_message(&self) -> Result<Message, BrokerError>;
}

/// Production broker session over `rumqttc`.
pub struct RumqttcBroker {
    client_id: String,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    availability_topic: String,
    client: Mutex<Option<AsyncClient>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl RumqttcBroker {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        availability_topic: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            username,
            password,
            availability_topic: availability_topic.into(),
            client: Mutex::new(None),
            driver: Mutex::new(None),
            inbox: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Broker for RumqttcBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut opts = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            opts.set_credentials(u.clone(), p.clone());
        }
        opts.set_last_will(LastWill::new(
            self.availability_topic.clone(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let (tx, rx) = mpsc::channel(256);

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let mut ready_tx = Some(ready_tx);

        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let _ = tx.send((p.topic, p.payload.to_vec())).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(e.to_string()));
                        }
                        break;
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BrokerError::ConnectFailed(e)),
            Err(_) => return Err(BrokerError::ConnectFailed("event loop ended before connecting".into())),
        }

        *self.client.lock().await = Some(client);
        *self.driver.lock().await = Some(handle);
        *self.inbox.lock().await = Some(rx);

        self.publish(&self.availability_topic, b"online", 1, true).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let _ = self.publish(&self.availability_topic, b"offline", 1, true).await;

        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.driver.lock().await.take() {
            handle.abort();
        }
        *self.inbox.lock().await = None;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), BrokerError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, qos_from_u8(qos), retain, payload.to_vec())
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))
    }

    async fn next_message(&self) -> Result<Message, BrokerError> {
        let mut guard = self.inbox.lock().await;
        match guard.as_mut() {
            Some(rx) => rx
                .recv()
                .await
                .ok_or_else(|| BrokerError::ReceiveFailed("event loop ended".into())),
            None => Err(BrokerError::NotConnected),
        }
    }
}

/// In-memory broker fake: lets tests drive publish failures, message
/// delivery, and connect/disconnect transitions without a real broker.
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct FakeBroker {
        pub connected: AtomicBool,
        pub fail_publish: AtomicBool,
        pub fail_connect: AtomicBool,
        pub fail_receive: AtomicBool,
        pub published: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
        inbox_tx: mpsc::Sender<Message>,
        inbox_rx: Mutex<mpsc::Receiver<Message>>,
    }

    impl FakeBroker {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::channel(256);
            Self {
                connected: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                fail_receive: AtomicBool::new(false),
                published: Mutex::new(Vec::new()),
                inbox_tx: tx,
                inbox_rx: Mutex::new(rx),
            }
        }

        pub async fn inject(&self, topic: &str, payload: &[u8]) {
            let _ = self.inbox_tx.send((topic.to_string(), payload.to_vec())).await;
        }
    }

    impl Default for FakeBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn connect(&self) -> Result<(), BrokerError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(BrokerError::ConnectFailed("fake connect failure".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BrokerError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), BrokerError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(BrokerError::PublishFailed("fake publish failure".into()));
            }
            self.published
                .lock()
                .await
                .push((topic.to_string(), payload.to_vec(), qos, retain));
            Ok(())
        }

        async fn subscribe(&self, _pattern: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn next_message(&self) -> Result<Message, BrokerError> {
            if self.fail_receive.load(Ordering::SeqCst) {
                return Err(BrokerError::ReceiveFailed("fake receive failure".into()));
            }
            self.inbox_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| BrokerError::ReceiveFailed("fake inbox closed".into()))
        }
    }
}
