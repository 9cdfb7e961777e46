use async_nats::HeaderMap;
use bytes::Bytes;
use std::time::Duration;

/// One NATS message, owned, flowing through a Tower consumer service.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
}

impl ConsumeRequest {
    pub fn new(subject: String, payload: Bytes, headers: Option<HeaderMap>) -> Self {
        Self {
            subject,
            payload,
            headers,
        }
    }
}

/// Whether the message should be acknowledged or redelivered.
#[derive(Debug, Clone)]
pub enum ConsumeResponse {
    /// Processed (or safely skippable) — acknowledge.
    Ack,
    /// Processing failed — negative-ack for redelivery, optionally after a
    /// broker-side delay (no blocking sleep in the worker).
    Nak {
        reason: Option<String>,
        delay: Option<Duration>,
    },
}

impl ConsumeResponse {
    pub fn ack() -> Self {
        Self::Ack
    }

    pub fn nak(reason: impl Into<String>) -> Self {
        Self::Nak {
            reason: Some(reason.into()),
            delay: None,
        }
    }

    pub fn nak_after(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Nak {
            reason: Some(reason.into()),
            delay: Some(delay),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    pub fn is_nak(&self) -> bool {
        matches!(self, Self::Nak { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_request_new() {
        let req = ConsumeRequest::new("activities.p3".to_string(), Bytes::from("payload"), None);
        assert_eq!(req.subject, "activities.p3");
        assert!(req.headers.is_none());
    }

    #[test]
    fn test_nak_with_delay() {
        let resp = ConsumeResponse::nak_after("ai timeout", Duration::from_secs(4));
        assert!(resp.is_nak());
        match resp {
            ConsumeResponse::Nak { reason, delay } => {
                assert_eq!(reason.as_deref(), Some("ai timeout"));
                assert_eq!(delay, Some(Duration::from_secs(4)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_ack() {
        assert!(ConsumeResponse::ack().is_ack());
        assert!(!ConsumeResponse::ack().is_nak());
    }
}
