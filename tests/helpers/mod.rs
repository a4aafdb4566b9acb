#![allow(dead_code)]

pub mod fixtures;
pub mod server;

pub use fixtures::{repo_path, request, tinytodo_entities, tinytodo_policies};
pub use server::TestServer;
