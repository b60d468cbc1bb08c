//! Endpoint dispatcher: picks the response configured for the request method

use crate::response::{not_found, CompileError, CompiledResponse, ResponseBody};
use crate::stats::StatisticsHandle;
use crate::template::PathVars;
use http_body_util::BodyExt;
use hyper::{Method, Response};
use mimicro_common::{EndpointConfig, HttpMethod, ReceivedRequest};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Request handler for one configured endpoint
pub struct EndpointHandler {
    server_name: Arc<str>,
    url: String,
    responses: HashMap<HttpMethod, CompiledResponse>,
    statistics: Option<StatisticsHandle>,
}

impl EndpointHandler {
    pub fn new(
        server_name: Arc<str>,
        config: &EndpointConfig,
        base_dir: &Path,
        statistics: Option<StatisticsHandle>,
    ) -> Result<Self, CompileError> {
        let responses: HashMap<_, _> = config
            .responses()
            .map(|(method, response)| Ok((method, CompiledResponse::compile(response, base_dir)?)))
            .collect::<Result<_, CompileError>>()?;

        Ok(Self {
            server_name,
            url: config.url.clone(),
            responses,
            statistics,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Respond to `method`, falling back to the standard not-found response.
    /// The request is recorded under the configured URL once the response
    /// body has been written out or dropped.
    pub async fn handle(&self, method: &Method, vars: &PathVars) -> Response<ResponseBody> {
        let compiled = HttpMethod::from_method(method).and_then(|m| self.responses.get(&m));

        let response = match compiled {
            Some(compiled) => compiled.render(vars).await,
            None => not_found(),
        };

        let request = ReceivedRequest {
            server_name: self.server_name.to_string(),
            url: self.url.clone(),
            method: method.as_str().to_string(),
            status_code: response.status().as_u16(),
        };
        info!("Requested {}", request);

        match &self.statistics {
            Some(statistics) => {
                let pending = PendingRecord {
                    statistics: statistics.clone(),
                    request: Some(request),
                };
                response.map(|body| {
                    body.map_frame(move |frame| {
                        let _ = &pending;
                        frame
                    })
                    .boxed_unsync()
                })
            }
            None => response,
        }
    }
}

/// Submits its record when the response body it is attached to goes away
struct PendingRecord {
    statistics: StatisticsHandle,
    request: Option<ReceivedRequest>,
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            self.statistics.record(request);
        }
    }
}
