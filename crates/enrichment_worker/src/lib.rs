pub mod domain;
pub mod enrichment_worker;
pub mod http;
pub mod nats;
