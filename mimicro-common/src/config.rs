//! Configuration types for Mimicro mock servers

use hyper::Method;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Prefix marking a response body that is served from a file
pub const FILE_PREFIX: &str = "file://";

/// Main configuration document
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MimicroConfig {
    /// Record every served request for the management API
    #[serde(default)]
    pub collect_statistics: bool,

    /// Management API settings
    #[serde(default)]
    pub management: ManagementConfig,

    /// Mock servers, one listener each
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Management API listening configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    /// Address to bind to
    #[serde(default = "default_management_address")]
    pub address: String,

    /// Management port
    #[serde(default = "default_management_port")]
    pub port: u16,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            address: default_management_address(),
            port: default_management_port(),
        }
    }
}

/// A single mock server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique name, used as the `server` field of statistics records
    pub name: String,

    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on
    pub port: u16,

    /// Endpoints served by this server
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// A URL pattern with at most one response per HTTP method
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// URL pattern, may contain `{name}` or `{name:regex}` path variables
    pub url: String,

    #[serde(rename = "GET", default)]
    pub get: Option<ResponseConfig>,

    #[serde(rename = "POST", default)]
    pub post: Option<ResponseConfig>,

    #[serde(rename = "PUT", default)]
    pub put: Option<ResponseConfig>,

    #[serde(rename = "PATCH", default)]
    pub patch: Option<ResponseConfig>,

    #[serde(rename = "DELETE", default)]
    pub delete: Option<ResponseConfig>,
}

impl EndpointConfig {
    /// Response configured for `method`, if any
    pub fn response(&self, method: HttpMethod) -> Option<&ResponseConfig> {
        match method {
            HttpMethod::Get => self.get.as_ref(),
            HttpMethod::Post => self.post.as_ref(),
            HttpMethod::Put => self.put.as_ref(),
            HttpMethod::Patch => self.patch.as_ref(),
            HttpMethod::Delete => self.delete.as_ref(),
        }
    }

    /// All configured responses, in method declaration order
    pub fn responses(&self) -> impl Iterator<Item = (HttpMethod, &ResponseConfig)> + '_ {
        HttpMethod::ALL
            .into_iter()
            .filter_map(move |method| self.response(method).map(|response| (method, response)))
    }
}

/// Declarative description of a mocked response
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseConfig {
    /// Inline template, or `file://<path>` to serve a file
    #[serde(default)]
    pub body: Option<String>,

    /// Path template of a file to serve
    #[serde(default)]
    pub file: Option<String>,

    /// Content type; defaults to `text/plain` for templates and is guessed for files
    #[serde(default)]
    pub content_type: Option<String>,

    /// Status code, 200 when omitted
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Where the body of a response comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySource<'a> {
    /// Template rendered with the request's path variables
    Template(&'a str),
    /// Path template of a file streamed as the body
    File(&'a str),
}

impl ResponseConfig {
    /// Resolve the single body source of this response.
    ///
    /// A `body` starting with `file://` is a file reference. Having both a
    /// `body` and a `file`, or neither, is an error.
    pub fn body_source(&self) -> Result<BodySource<'_>, ConfigError> {
        match (self.body.as_deref(), self.file.as_deref()) {
            (Some(body), None) => Ok(match body.strip_prefix(FILE_PREFIX) {
                Some(path) => BodySource::File(path),
                None => BodySource::Template(body),
            }),
            (None, Some(file)) => Ok(BodySource::File(
                file.strip_prefix(FILE_PREFIX).unwrap_or(file),
            )),
            (Some(_), Some(_)) => Err(ConfigError::ValidationError(
                "response has both `body` and `file`".to_string(),
            )),
            (None, None) => Err(ConfigError::ValidationError(
                "response has neither `body` nor `file`".to_string(),
            )),
        }
    }

    /// Content type to send, `None` meaning "detect from the file"
    pub fn effective_content_type(&self) -> Option<&str> {
        match (&self.content_type, self.body_source()) {
            (Some(content_type), _) => Some(content_type.as_str()),
            (None, Ok(BodySource::Template(_))) => Some(DEFAULT_CONTENT_TYPE),
            (None, _) => None,
        }
    }

    /// Status code to send
    pub fn effective_status_code(&self) -> u16 {
        self.status_code.unwrap_or(DEFAULT_STATUS_CODE)
    }
}

/// Content type of template responses that do not set one
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Status code of responses that do not set one
pub const DEFAULT_STATUS_CODE: u16 = 200;

/// HTTP methods an endpoint can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 5] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Map a request method; methods that cannot be configured yield `None`
    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET => Some(HttpMethod::Get),
            Method::POST => Some(HttpMethod::Post),
            Method::PUT => Some(HttpMethod::Put),
            Method::PATCH => Some(HttpMethod::Patch),
            Method::DELETE => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_management_address() -> String {
    "127.0.0.1".to_string()
}

fn default_management_port() -> u16 {
    4444
}

impl MimicroConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check the structural rules that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        if self.management.port != 0 {
            ports.insert(self.management.port);
        }

        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }

            if server.port != 0 && !ports.insert(server.port) {
                return Err(ConfigError::ValidationError(format!(
                    "server '{}': port {} is already in use by another listener",
                    server.name, server.port
                )));
            }

            let mut urls = HashSet::new();
            for endpoint in &server.endpoints {
                if !endpoint.url.starts_with('/') {
                    return Err(ConfigError::ValidationError(format!(
                        "server '{}': url '{}' must start with '/'",
                        server.name, endpoint.url
                    )));
                }

                if !urls.insert(endpoint.url.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "server '{}': duplicate url '{}'",
                        server.name, endpoint.url
                    )));
                }

                for (method, response) in endpoint.responses() {
                    response.body_source().map_err(|e| {
                        ConfigError::ValidationError(format!(
                            "server '{}', {} {}: {}",
                            server.name, method, endpoint.url, e
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
