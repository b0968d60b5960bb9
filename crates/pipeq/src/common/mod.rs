pub mod cli;
pub mod config;
pub mod error;
pub mod notify;
pub mod setup;
pub mod tee;
pub mod utils;
