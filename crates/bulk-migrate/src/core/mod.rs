//! Core data model shared by producers, the batch writer and targets.
//!
//! - [`value`]: SQL value representation
//! - [`mutation`]: row mutations and the batches that carry them

pub mod mutation;
pub mod value;

pub use mutation::{Batch, BatchStatus, Mutation};
pub use value::{SqlNullType, SqlValue};
