mod envelope;

pub use envelope::{
    envelope_from_wire, envelope_to_wire, EnvelopeMessage, ENVELOPE_SCHEMA_VERSION,
};
