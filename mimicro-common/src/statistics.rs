//! Statistics records exchanged between mock servers and the management API

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of a query field that matches anything
pub const WILDCARD: &str = "*";

/// A request served by a mock server, the key of the statistics table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceivedRequest {
    pub server_name: String,
    /// Configured URL pattern of the endpoint, not the live request path
    pub url: String,
    pub method: String,
    pub status_code: u16,
}

impl fmt::Display for ReceivedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server: {}; url: {}; method: {}; response status: {}",
            self.server_name, self.url, self.method, self.status_code
        )
    }
}

/// Filter over received requests. `None` fields match any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRecord {
    pub server_name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
}

impl QueryRecord {
    /// Query matching every stored record
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a query from raw parameter values.
    ///
    /// Missing, empty, and `*` values become wildcards. Methods are
    /// compared upper-cased.
    pub fn from_params(server: Option<&str>, url: Option<&str>, method: Option<&str>) -> Self {
        Self {
            server_name: concrete(server),
            url: concrete(url),
            method: concrete(method).map(|m| m.to_uppercase()),
        }
    }

    pub fn server(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// True when every concrete field equals the record's field
    pub fn matches(&self, request: &ReceivedRequest) -> bool {
        field_matches(&self.server_name, &request.server_name)
            && field_matches(&self.url, &request.url)
            && field_matches(&self.method, &request.method)
    }
}

fn concrete(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.is_empty() && *v != WILDCARD)
        .map(str::to_string)
}

fn field_matches(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().map_or(true, |expected| expected == value)
}

/// One row of a statistics query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsEntry {
    pub server: String,
    pub url: String,
    pub method: String,
    pub count: u64,
}

impl StatisticsEntry {
    pub fn new(request: &ReceivedRequest, count: u64) -> Self {
        Self {
            server: request.server_name.clone(),
            url: request.url.clone(),
            method: request.method.clone(),
            count,
        }
    }
}
