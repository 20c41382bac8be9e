//! Tavola server library.
//!
//! The binary in `main.rs` wires these modules together; integration
//! tests drive the services directly with in-memory fakes.
//!
//! # Architecture
//!
//! - `config` - environment-driven configuration
//! - `db` - `PostgreSQL` repositories and the store adapter
//! - `models` - domain entities shared across layers
//! - `services` - the automation service, mail transport, scheduler
//! - `routes` - the admin newsletter API
//! - `error` - HTTP error mapping

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
