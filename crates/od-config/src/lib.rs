pub mod model;
pub mod store;

pub use model::*;
pub use store::{ConfigStore, Module};
