pub mod checkpoint_store;
pub mod client;
pub mod config;
pub mod feed;

pub use checkpoint_store::*;
pub use client::*;
pub use config::*;
pub use feed::*;
