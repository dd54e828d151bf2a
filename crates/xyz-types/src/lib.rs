//! Core types for xyz microservice nodes.
//!
//! This crate defines the configuration shapes and the error taxonomy shared
//! by the wire layer and the command-line binary. It contains no business logic.

pub mod config;
pub mod error;

pub use config::{MicroserviceConf, NodeConfig, RpcConfig, SelfConf, SystemConf};
pub use error::{XyzError, XyzResult};
