pub mod avro;
pub mod connectors;
pub mod conversions;
pub mod error;
pub mod index;
pub mod load;
pub mod macros;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod stage;
pub mod warehouse;
