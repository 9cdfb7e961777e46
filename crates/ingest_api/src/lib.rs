pub mod domain;
pub mod http;
pub mod ingest_api;
