//! A local, single-user context store for AI agents: typed notes, usage
//! observation, and a self-improvement loop, served over a stdio tool-call
//! surface and a REST API.

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod ids;
pub mod improver;
pub mod model;
pub mod observer;
pub mod persist;
pub mod runtime;
pub mod schema;
pub mod selfmodel;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::{Result, RuntimeError};
pub use runtime::Runtime;
