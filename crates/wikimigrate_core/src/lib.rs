pub mod backoff;
pub mod classify;
pub mod config;
pub mod content;
pub mod destination;
pub mod error;
pub mod identity;
pub mod maintenance;
pub mod mapper;
pub mod model;
pub mod reconcile;
pub mod session;
pub mod source;
pub mod sync;
pub mod transcode;

#[cfg(test)]
mod test_support;
