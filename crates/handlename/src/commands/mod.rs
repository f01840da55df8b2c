pub mod cache;
pub mod extract;
pub mod resolve;
