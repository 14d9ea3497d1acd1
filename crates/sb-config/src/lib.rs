//! Configuration types and path resolution for Switchboard

pub mod paths;
pub mod types;

pub use types::{
    ClientRecord, InputParam, InputParamType, ServerConfig, ServerStatus, ServerType,
};
