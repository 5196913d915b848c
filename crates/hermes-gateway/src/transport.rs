//! Counterpart gateway transport.
//!
//! One request/response exchange per protocol message: send a signed
//! [`Message`] to the counterpart's base path and get its signed answer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hermes_types::{GatewayError, Message, Result, constants};
use parking_lot::Mutex;

use crate::Gateway;

#[async_trait]
pub trait CounterpartTransport: Send + Sync {
    async fn send(&self, base_path: &str, message: &Message) -> Result<Message>;
}

/// Route for a message under a gateway's base path.
#[must_use]
pub fn route(base_path: &str, message: &Message) -> String {
    format!(
        "{}{}/{}",
        base_path.trim_end_matches('/'),
        constants::API_PREFIX,
        message.message_type.phase()
    )
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// JSON over HTTP(S). A 2xx answer must carry a `Message` body; anything
/// else is a [`GatewayError::CounterpartRejected`].
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterpartTransport for HttpTransport {
    async fn send(&self, base_path: &str, message: &Message) -> Result<Message> {
        let url = route(base_path, message);
        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| GatewayError::DeliveryFailed {
                target: url.clone(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| GatewayError::DeliveryFailed {
            target: url.clone(),
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(GatewayError::CounterpartRejected {
                status: status.as_u16(),
                reason: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Message::from_json(&body)
    }
}

/// Server-side half of the HTTP exchange: decode a request body, run it
/// through `gateway`, and produce the status and body to answer with.
pub async fn serve_request(gateway: &Gateway, body: &[u8]) -> (u16, Vec<u8>) {
    let outcome = match Message::from_json(body) {
        Ok(message) => gateway.handle_message(message).await,
        Err(err) => Err(err),
    };
    match outcome.and_then(|reply| serde_json::to_vec(&reply).map_err(GatewayError::from)) {
        Ok(bytes) => (200, bytes),
        Err(err) => (err.http_status(), err.to_string().into_bytes()),
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Routes messages straight into gateways living in the same process.
///
/// Gateways are registered by base path. A path can be marked unreachable
/// or slowed down; every delivered request and its answer is recorded.
#[derive(Default)]
pub struct LocalTransport {
    peers: Mutex<HashMap<String, Weak<Gateway>>>,
    unreachable: Mutex<HashSet<String>>,
    latency: Mutex<HashMap<String, Duration>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    transcript: Mutex<Vec<Message>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, gateway: &Arc<Gateway>) {
        self.peers
            .lock()
            .insert(gateway.base_path().to_string(), Arc::downgrade(gateway));
    }

    pub fn set_reachable(&self, base_path: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(base_path);
        } else {
            unreachable.insert(base_path.to_string());
        }
    }

    /// Delay every delivery to `base_path` by `delay`.
    pub fn set_latency(&self, base_path: &str, delay: Duration) {
        self.latency.lock().insert(base_path.to_string(), delay);
    }

    /// Fail the next `count` deliveries to `base_path` with a retryable error.
    pub fn fail_next(&self, base_path: &str, count: u32) {
        self.transient_failures.lock().insert(base_path.to_string(), count);
    }

    /// Requests and answers in delivery order.
    #[must_use]
    pub fn transcript(&self) -> Vec<Message> {
        self.transcript.lock().clone()
    }

    fn take_transient_failure(&self, base_path: &str) -> bool {
        let mut failures = self.transient_failures.lock();
        match failures.get_mut(base_path) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CounterpartTransport for LocalTransport {
    async fn send(&self, base_path: &str, message: &Message) -> Result<Message> {
        let delay = self.latency.lock().get(base_path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().contains(base_path) || self.take_transient_failure(base_path) {
            return Err(GatewayError::DeliveryFailed {
                target: base_path.to_string(),
                reason: "connection refused".into(),
            });
        }
        let peer = self.peers.lock().get(base_path).and_then(Weak::upgrade);
        let Some(peer) = peer else {
            return Err(GatewayError::DeliveryFailed {
                target: base_path.to_string(),
                reason: "no gateway at this address".into(),
            });
        };

        self.transcript.lock().push(message.clone());
        let reply = peer
            .handle_message(message.clone())
            .await
            .map_err(|err| GatewayError::CounterpartRejected {
                status: err.http_status(),
                reason: err.to_string(),
            })?;
        self.transcript.lock().push(reply.clone());
        Ok(reply)
    }
}
