//! Wire format and shared data model for the multi-technology ranging core.
//!
//! This crate has no async runtime dependency on purpose: it is the crate an
//! adapter implementation, a test harness, or `ranging-service` itself links
//! against to speak the same `TechCapability`/`TechConfig`/OOB-message types.

pub mod codec;
pub mod error;
pub mod model;

pub use codec::{OobMessage, TechSet};
pub use error::{CodecError, RangingError};
pub use model::*;
