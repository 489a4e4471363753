pub mod client;
pub mod errors;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;
pub mod streams;
pub mod tools;

pub use errors::{ChatError, ChatResult, DisplayableError, ErrorKind};
