#![forbid(unsafe_code)]

mod engine;
mod error;
mod store;

pub use engine::*;
pub use error::*;
pub use store::*;
