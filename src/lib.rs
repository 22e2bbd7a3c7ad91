//! Multi-provider generation relay: one request model, many interchangeable
//! text, image, video and speech providers, with retry, job polling and
//! ordered fallback.

pub mod batch;
pub mod cli;
pub mod clock;
pub mod config;
pub mod constants;
pub mod core;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod normalize;
pub mod persist;
pub mod platforms;
pub mod progress;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod response;
pub mod retry;
pub mod sink;
pub mod telemetry;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;
