//! Broker-facing plumbing: schema loading/validation and the publish path.

pub mod publisher;
pub mod schema;
