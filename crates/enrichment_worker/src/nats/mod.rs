mod envelope_consumer_service;

pub use envelope_consumer_service::EnvelopeConsumerService;
