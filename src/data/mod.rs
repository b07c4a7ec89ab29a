pub mod cache;
pub mod tuples;
pub mod types;
