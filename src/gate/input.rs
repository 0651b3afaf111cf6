use std::sync::LazyLock;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName, Request};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::gate::errors::{AuthorizationError, ConfigError};

/// Header read by the raw-header strategy when no name is configured.
pub const DEFAULT_IDENTITY_HEADER: &str = "X-Auth-Bearer";

static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Bearer\s+(\S+)$").expect("bearer pattern is valid"));

/// How the caller identity is pulled out of request headers.
///
/// Deserializes from `{ strategy = "bearer" }` or
/// `{ strategy = "header", name = "X-Auth-Bearer" }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum IdentityStrategy {
    /// Token from `Authorization: Bearer <token>`.
    #[default]
    Bearer,
    /// Verbatim value of a dedicated header.
    Header {
        #[serde(default = "default_identity_header")]
        name: String,
    },
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

impl IdentityStrategy {
    pub fn header(name: impl Into<String>) -> Self {
        IdentityStrategy::Header { name: name.into() }
    }

    /// Validate the strategy into an extractor usable on the request path.
    pub fn compile(&self) -> Result<IdentityExtractor, ConfigError> {
        match self {
            IdentityStrategy::Bearer => Ok(IdentityExtractor::Bearer),
            IdentityStrategy::Header { name } => HeaderName::from_bytes(name.as_bytes())
                .map(IdentityExtractor::Header)
                .map_err(|_| ConfigError::InvalidHeaderName(name.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum IdentityExtractor {
    Bearer,
    Header(HeaderName),
}

impl IdentityExtractor {
    /// Never fails: any header shape that does not yield an identity leaves
    /// it absent.
    pub fn extract(&self, headers: &HeaderMap) -> Option<String> {
        match self {
            IdentityExtractor::Bearer => {
                let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
                BEARER_RE
                    .captures(value)
                    .and_then(|caps| caps.get(1))
                    .map(|token| token.as_str().to_string())
            }
            IdentityExtractor::Header(name) => headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        }
    }
}

/// The document a policy sees as `input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionInput {
    pub method: String,
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl DecisionInput {
    /// Fails only when the percent-decoded path is not UTF-8.
    pub fn from_request<B>(
        request: &Request<B>,
        identity: &IdentityExtractor,
    ) -> Result<Self, AuthorizationError> {
        Ok(Self {
            method: request.method().as_str().to_string(),
            path: decode_path(request.uri().path())?,
            identity: identity.extract(request.headers()),
        })
    }

    pub fn to_document(&self) -> Value {
        let mut doc = json!({
            "method": self.method,
            "path": self.path,
        });
        if let Some(identity) = &self.identity {
            doc["identity"] = Value::String(identity.clone());
        }
        doc
    }
}

/// Percent-decode the whole path, then split it. An encoded `/` separates
/// segments like a literal one, matching what file-serving upstreams see.
pub fn decode_path(raw: &str) -> Result<Vec<String>, AuthorizationError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| AuthorizationError::MalformedPath(raw.to_string()))?;
    Ok(split_path(&decoded))
}

/// Drop one leading `/` and split the rest on `/`, keeping empty segments.
pub fn split_path(path: &str) -> Vec<String> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .map(str::to_string)
        .collect()
}
