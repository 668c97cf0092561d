//! bootc-devvm: local VM lifecycle for bootc disk images.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod vm;

pub use error::{VmError, VmResult};
