pub mod extraction;
pub mod learning;
