use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::gate::config::{parse_directives, ChainConfig, GateConfig};
use crate::gate::errors::ConfigError;
use crate::remote_addr::OutputStream;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub site: Site,
    /// Directive file describing the handler chain. Mutually exclusive with
    /// `remote_addr` and `[gate]`.
    #[serde(default)]
    pub directives: Option<PathBuf>,
    #[serde(default)]
    pub remote_addr: Option<OutputStream>,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    /// Directory served to admitted requests
    pub root: PathBuf,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for Site {
    fn default() -> Self {
        Self {
            root: PathBuf::from("public"),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default(
                "site.root",
                Site::default().root.to_string_lossy().to_string(),
            )
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: PORTCULLIS__SERVER__PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("PORTCULLIS").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(s)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The handler chain, read either from the directive file or from the
    /// structured settings.
    pub fn chain_config(&self) -> Result<ChainConfig, ConfigError> {
        let inline = ChainConfig {
            remote_addr: self.remote_addr,
            gate: self.gate.clone(),
        };

        let Some(path) = &self.directives else {
            return Ok(inline);
        };
        if !inline.is_empty() {
            return Err(ConfigError::ConflictingSources);
        }

        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        parse_directives(&src)
    }
}
