//! Shared utilities: id generation, collection constructors, vector math.

pub mod collections;
pub mod id_generator;
