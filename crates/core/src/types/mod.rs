//! Core types for Tavola.
//!
//! Type-safe wrappers for the domain concepts shared between the ordering
//! backend and the email automation service.

pub mod email;
pub mod id;
pub mod price;

pub use email::{Email, EmailError};
pub use id::*;
pub use price::Price;
