//! Bounded delivery retries.
//!
//! Each attempt is capped by the session's `max_timeout`; retryable
//! failures are re-sent up to `max_retries` more times with capped
//! exponential backoff. Non-retryable failures (the counterpart answered
//! and said no) return immediately.

use hermes_types::{GatewayError, Message, Result, RetryPolicy};
use tracing::{Span, info, warn};

use crate::CounterpartTransport;

pub async fn deliver_with_retry(
    transport: &dyn CounterpartTransport,
    base_path: &str,
    message: &Message,
    policy: &RetryPolicy,
    span: &Span,
) -> Result<Message> {
    let attempts = policy.attempts();
    let mut last = None;

    for attempt in 1..=attempts {
        let backoff = policy.backoff_before(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        let outcome = match tokio::time::timeout(policy.max_timeout(), transport.send(base_path, message)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::DeliveryTimeout {
                target: base_path.to_string(),
                timeout_ms: policy.max_timeout_ms,
            }),
        };

        match outcome {
            Ok(reply) => {
                if attempt > 1 {
                    info!(parent: span, session = %message.session_id, attempt, "Delivery succeeded after retry");
                }
                return Ok(reply);
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    parent: span,
                    session = %message.session_id,
                    message_type = %message.message_type,
                    attempt,
                    attempts,
                    error = %err,
                    "Delivery attempt failed"
                );
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(GatewayError::RetriesExhausted {
        attempts,
        last: last.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use hermes_types::{GatewayId, MessageType, Payload, RollbackRequest, SessionId};

    use super::*;

    /// Fails `failures` times with `error`, then echoes the message back.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        retryable: bool,
        hang: bool,
    }

    impl Flaky {
        fn new(failures: u32, retryable: bool) -> Self {
            Self { failures, calls: AtomicU32::new(0), retryable, hang: false }
        }
    }

    #[async_trait]
    impl CounterpartTransport for Flaky {
        async fn send(&self, base_path: &str, message: &Message) -> Result<Message> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if n < self.failures {
                return Err(if self.retryable {
                    GatewayError::DeliveryFailed { target: base_path.into(), reason: "refused".into() }
                } else {
                    GatewayError::CounterpartRejected { status: 400, reason: "bad".into() }
                });
            }
            Ok(message.clone())
        }
    }

    fn message() -> Message {
        Message {
            message_type: MessageType::RollbackRequest,
            session_id: SessionId::new(),
            sequence_number: 1,
            hash_prev_message: None,
            source_gateway_pubkey: GatewayId([1; 32]),
            recipient_gateway_pubkey: GatewayId([2; 32]),
            timestamp: Utc::now(),
            payload: Payload::RollbackRequest(RollbackRequest { reason: "test".into() }),
            signature: String::new(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, max_timeout_ms: 50, backoff_ms: 1 }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let t = Flaky::new(2, true);
        let reply = deliver_with_retry(&t, "peer", &message(), &policy(3), &Span::none()).await;
        assert!(reply.is_ok());
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let t = Flaky::new(100, true);
        let err = deliver_with_retry(&t, "peer", &message(), &policy(2), &Span::none()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let t = Flaky::new(1, false);
        let err = deliver_with_retry(&t, "peer", &message(), &policy(5), &Span::none()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CounterpartRejected { status: 400, .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_attempt_is_time_bounded() {
        let mut t = Flaky::new(0, true);
        t.hang = true;
        let err = deliver_with_retry(&t, "peer", &message(), &policy(1), &Span::none()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }
}
