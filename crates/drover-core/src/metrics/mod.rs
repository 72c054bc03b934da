pub mod collector;
pub mod schema;
pub mod writer;
