pub mod annotate;
pub mod cache;
pub mod cli;
pub mod comments;
pub mod config;
pub mod diff;
pub mod error;
pub mod plugins;
pub mod pr;
pub mod process;
pub mod rpc;
pub mod schema;
pub mod service;
pub mod store;
pub mod test_helpers;
pub mod threads;
pub mod upstream;
