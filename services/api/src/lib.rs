//! services/api/src/lib.rs
//!
//! The EcoKids host process: configuration, adapters for the core ports, and
//! the web layer that drives reading and chat sessions for connected clients.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
