//! Xenlite Shared - types used on both sides of the toolstack boundary
//!
//! This crate contains the error taxonomy and the store/stream constants
//! that the core library and its collaborators must agree on.

pub mod constants;
pub mod errors;

pub use errors::{XenliteError, XenliteResult};
