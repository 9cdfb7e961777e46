use crate::domain::{EnrichmentService, EnvelopeDisposition};
use common::nats::{ConsumeRequest, ConsumeResponse};
use common::proto::{envelope_from_wire, EnvelopeMessage};
use futures::future::BoxFuture;
use prost::Message;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;
use tracing::{debug, error, warn};

/// Redelivery delay for infrastructure failures that carry no per-attempt
/// backoff of their own.
const INFRA_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Tower service turning one broker message into one enrichment pass.
///
/// Undecodable messages are acked: redelivering a poison pill cannot ever
/// succeed, and the activity remains visible in the store for operators.
#[derive(Clone)]
pub struct EnvelopeConsumerService {
    service: Arc<EnrichmentService>,
}

impl EnvelopeConsumerService {
    pub fn new(service: Arc<EnrichmentService>) -> Self {
        Self { service }
    }
}

impl Service<ConsumeRequest> for EnvelopeConsumerService {
    type Response = ConsumeResponse;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<ConsumeResponse, anyhow::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ConsumeRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            let message = match EnvelopeMessage::decode(request.payload.as_ref()) {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        subject = %request.subject,
                        error = %e,
                        "failed to decode envelope, acking to drop poison pill"
                    );
                    return Ok(ConsumeResponse::ack());
                }
            };

            let envelope = match envelope_from_wire(message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(
                        subject = %request.subject,
                        error = %e,
                        "envelope does not convert to domain, acking"
                    );
                    return Ok(ConsumeResponse::ack());
                }
            };

            match service.process_envelope(envelope).await {
                Ok(EnvelopeDisposition::Completed) | Ok(EnvelopeDisposition::Skipped) => {
                    Ok(ConsumeResponse::ack())
                }
                Ok(EnvelopeDisposition::Retry { reason, delay }) => {
                    debug!(subject = %request.subject, reason = %reason, "scheduling redelivery");
                    Ok(ConsumeResponse::nak_after(reason, delay))
                }
                Err(e) => {
                    warn!(subject = %request.subject, error = %e, "enrichment pass failed");
                    Ok(ConsumeResponse::nak_after(e.to_string(), INFRA_RETRY_DELAY))
                }
            }
        })
    }
}
