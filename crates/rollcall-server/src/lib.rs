//! # rollcall-server
//!
//! HTTP server library for rollcall, automatic event attendance.
//!
//! This library provides the API handlers and state management for the
//! server. The server hosts one attendance engine backed by simulated device
//! collaborators, so the whole flow can be driven over HTTP.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
