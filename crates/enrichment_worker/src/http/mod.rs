mod enrichment_client;

pub use enrichment_client::{HttpEnricher, HttpEnricherConfig};
