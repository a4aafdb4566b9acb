//! Canopy - entity hierarchy store and policy decision service
//!
//! Entities form a parent graph; permit/forbid policies scoped by principal,
//! action and resource are evaluated against it with deny-overrides.

pub mod authz;
pub mod client;
pub mod errors;
pub mod settings;
pub mod web;
