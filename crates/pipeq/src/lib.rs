#![deny(clippy::await_holding_refcell_ref)]

pub mod batch;
pub mod client;
pub mod common;
pub mod marker;
pub mod model;
pub mod orchestrator;
pub mod projector;
pub mod report;
pub mod rundir;
pub mod scheduler;
pub mod script;
pub mod wrapper;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::PipeqError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = std::collections::BTreeMap<K, V>;

pub const TOOL_NAME: &str = "pipeq";

pub const PIPEQ_VERSION: &str = {
    match option_env!("PIPEQ_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
