#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use frame_relay::handle::DeliveryConfig;
use frame_relay::ingest::ProducerLimits;
use frame_relay::producer::ProducerPolicy;
use frame_relay::{router, AppState, Relay};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn create_test_state(policy: ProducerPolicy) -> AppState {
    create_test_state_with(policy, test_limits())
}

pub fn create_test_state_with(policy: ProducerPolicy, limits: ProducerLimits) -> AppState {
    AppState::new(Relay::new(DeliveryConfig::default(), policy), limits)
}

pub fn test_limits() -> ProducerLimits {
    ProducerLimits {
        max_message_bytes: 1024 * 1024,
        ..ProducerLimits::default()
    }
}

/// A relay listening on an ephemeral localhost port.
pub struct TestServer {
    pub state: AppState,
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(policy: ProducerPolicy) -> Self {
        Self::start_with(policy, test_limits()).await
    }

    pub async fn start_with(policy: ProducerPolicy, limits: ProducerLimits) -> Self {
        let state = create_test_state_with(policy, limits);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone(), None);
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { state, addr, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Connect a viewer and wait until the relay has registered it.
    pub async fn subscribe(&self) -> Client {
        let before = self.state.relay.registry().len();
        let (client, _) = connect_async(self.url("/view")).await.expect("viewer handshake");
        let registry = self.state.relay.registry().clone();
        wait_until(|| registry.len() > before).await;
        client
    }

    /// Connect a producer and wait until it holds the slot.
    pub async fn produce(&self) -> Client {
        let before = self.state.relay.producers().active_count();
        let (client, _) = connect_async(self.url("/stream")).await.expect("producer handshake");
        let producers = self.state.relay.producers().clone();
        wait_until(|| producers.active_count() > before).await;
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next data frame from the relay, skipping control frames.
pub async fn next_frame(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return msg,
                Some(Ok(Message::Close(frame))) => panic!("connection closed: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("read failed: {}", e),
                None => panic!("stream ended"),
            }
        }
    })
    .await
    .expect("no frame in time")
}

pub async fn next_text(client: &mut Client) -> String {
    match next_frame(client).await {
        Message::Text(text) => text.as_str().to_owned(),
        other => panic!("expected text frame, got {:?}", other),
    }
}
