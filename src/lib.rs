//! Task Relay library.
//!
//! Multi-tenant task backend: JWT-authenticated task CRUD, deferred
//! `pending -> completed` transitions and WebSocket push on completion.

pub mod auth;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
