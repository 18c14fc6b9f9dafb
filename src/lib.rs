#![allow(clippy::uninlined_format_args)]

pub mod comment;
pub mod config;
pub mod state;
pub mod tree;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use comment::{Comment, Score, Vote};
pub use state::Manager;
pub use tree::{Engine, Entry, Input};
