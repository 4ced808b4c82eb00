//! Wire encodings for event batches

pub mod avro;
pub mod json;
