//! Management API: statistics query and reset over HTTP

use crate::listener::{self, Shutdown};
use crate::response::{full_body, not_found, text_response, ResponseBody};
use crate::stats::StatisticsHandle;
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use mimicro_common::{ManagementConfig, QueryRecord};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use url::form_urlencoded;

const GET_PATH: &str = "/statistics/get";
const RESET_PATH: &str = "/statistics/reset";

#[derive(Serialize)]
struct ResetResult {
    deleted: usize,
}

/// The bound management listener
pub struct ManagementRuntime {
    listener: TcpListener,
    statistics: Option<StatisticsHandle>,
}

impl ManagementRuntime {
    /// Bind the management listener. Without `statistics` the statistics
    /// routes are not registered.
    pub async fn bind(config: &ManagementConfig, statistics: Option<StatisticsHandle>) -> Result<Self> {
        let addr = format!("{}:{}", config.address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("management: failed to bind {}", addr))?;

        Ok(Self {
            listener,
            statistics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, shutdown: Shutdown) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("[Management] Listening on http://{}", addr);
        }

        let statistics = Arc::new(self.statistics);
        listener::serve(self.listener, Arc::from("Management"), shutdown, move |req| {
            let statistics = statistics.clone();
            async move { handle_request(Option::as_ref(&statistics), req).await }
        })
        .await;
    }
}

async fn handle_request(
    statistics: Option<&StatisticsHandle>,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let Some(statistics) = statistics else {
        return not_found();
    };

    let path = req.uri().path();
    if path != GET_PATH && path != RESET_PATH {
        return not_found();
    }
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed\n");
    }

    let query = parse_query(req.uri().query());
    if path == GET_PATH {
        let entries = statistics.query(&query).await;
        json_response(serde_json::to_vec(&entries))
    } else {
        match statistics.reset(query).await {
            Ok(deleted) => json_response(serde_json::to_vec(&ResetResult { deleted })),
            Err(e) => {
                error!("[Management] Reset failed: {}", e);
                text_response(StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e))
            }
        }
    }
}

/// Read `server`, `url` and `method` parameters; anything omitted is a wildcard
fn parse_query(query: Option<&str>) -> QueryRecord {
    let mut server = None;
    let mut url = None;
    let mut method = None;

    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        let slot = match key.as_ref() {
            "server" => &mut server,
            "url" => &mut url,
            "method" => &mut method,
            _ => continue,
        };
        // First occurrence wins.
        slot.get_or_insert(value.into_owned());
    }

    QueryRecord::from_params(server.as_deref(), url.as_deref(), method.as_deref())
}

fn json_response(payload: serde_json::Result<Vec<u8>>) -> Response<ResponseBody> {
    match payload {
        Ok(payload) => {
            let mut response = Response::new(full_body(payload));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("[Management] Failed to serialize statistics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
