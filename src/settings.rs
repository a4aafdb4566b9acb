use crate::errors::CanopyError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub data: Data,
    pub resolver: Resolver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Requests taking longer than this are answered with 408.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    /// JSON array of entity records loaded at startup. Default: data/entities.json
    pub entities_path: PathBuf,
    /// Directory of `.kdl` and `.json` policy files. Default: policies
    pub policies_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Resolver {
    /// Precompute every ancestor closure after each entity load.
    #[serde(default)]
    pub warm_cache: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8180,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for Data {
    fn default() -> Self {
        Self {
            entities_path: PathBuf::from("data/entities.json"),
            policies_dir: PathBuf::from("policies"),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, CanopyError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)?
            .set_default("server.port", Server::default().port)?
            .set_default(
                "server.request_timeout_secs",
                Server::default().request_timeout_secs,
            )?
            .set_default(
                "data.entities_path",
                Data::default().entities_path.to_string_lossy().to_string(),
            )?
            .set_default(
                "data.policies_dir",
                Data::default().policies_dir.to_string_lossy().to_string(),
            )?
            .set_default("resolver.warm_cache", false)?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: CANOPY__SERVER__PORT=9090, etc.
        builder = builder.add_source(config::Environment::with_prefix("CANOPY").separator("__"));

        let cfg = builder.build()?;
        let mut s: Settings = cfg.try_deserialize()?;

        // Normalize data paths to be relative to current dir
        if s.data.entities_path.is_relative() {
            s.data.entities_path = std::env::current_dir()?.join(&s.data.entities_path);
        }
        if s.data.policies_dir.is_relative() {
            s.data.policies_dir = std::env::current_dir()?.join(&s.data.policies_dir);
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
