//! Repository layer: table-scoped database operations.

mod kv;

pub use kv::*;
