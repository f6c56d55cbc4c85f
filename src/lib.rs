//! node-rotator: safe rotation of cloud-managed Kubernetes node pools
//!
//! Cordons and drains aged nodes one at a time, relocating any replica that
//! would otherwise leave its controller without a ready pod.

pub mod cluster;
pub mod config;
pub mod error;
pub mod rotation;

pub use crate::error::{Error, Result};
