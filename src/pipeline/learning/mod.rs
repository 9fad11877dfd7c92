//! Template learning: which pages and which tier worked for documents of a given shape.

pub mod pattern;
pub mod store;

pub use pattern::*;
pub use store::*;
