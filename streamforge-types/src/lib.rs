//! Streamforge Types
//!
//! Shared job payloads, asset manifests and result schemas used by the
//! transcoding services.

pub mod schemas;
pub mod error;

pub use schemas::*;
pub use error::*;
