pub mod validate;
pub mod writer;
