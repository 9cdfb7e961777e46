pub mod domain;
pub mod nats;
pub mod outbox_relay;
