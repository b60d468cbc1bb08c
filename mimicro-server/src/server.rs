//! Mock server runtime: one listener per configured server

use crate::endpoint::EndpointHandler;
use crate::listener::{self, Shutdown};
use crate::response::{not_found, ResponseBody};
use crate::stats::StatisticsHandle;
use crate::template::RoutePattern;
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::{Request, Response};
use mimicro_common::ServerConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

struct Route {
    pattern: RoutePattern,
    handler: EndpointHandler,
}

/// Compiled endpoints of one server, matched in configuration order
pub struct Routes(Vec<Route>);

impl Routes {
    /// Compile every endpoint of `config`. Surfaces template, route and
    /// missing-file errors without touching the network.
    pub fn compile(
        config: &ServerConfig,
        base_dir: &Path,
        statistics: Option<StatisticsHandle>,
    ) -> Result<Self> {
        let name: Arc<str> = Arc::from(config.name.as_str());

        config
            .endpoints
            .iter()
            .map(|endpoint| {
                let pattern = RoutePattern::parse(&endpoint.url)
                    .with_context(|| format!("server '{}'", config.name))?;
                let handler =
                    EndpointHandler::new(name.clone(), endpoint, base_dir, statistics.clone())
                        .with_context(|| {
                            format!("server '{}', url '{}'", config.name, endpoint.url)
                        })?;
                Ok(Route { pattern, handler })
            })
            .collect::<Result<Vec<_>>>()
            .map(Routes)
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let path = req.uri().path();
        for route in &self.0 {
            if let Some(vars) = route.pattern.matches(path) {
                return route.handler.handle(req.method(), &vars).await;
            }
        }

        debug!("No endpoint for {} {}", req.method(), path);
        not_found()
    }
}

/// A bound, not yet serving, mock server
pub struct ServerRuntime {
    name: Arc<str>,
    listener: TcpListener,
    routes: Arc<Routes>,
}

impl ServerRuntime {
    pub async fn bind(
        config: &ServerConfig,
        base_dir: &Path,
        statistics: Option<StatisticsHandle>,
    ) -> Result<Self> {
        let routes = Routes::compile(config, base_dir, statistics)?;

        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("server '{}': failed to bind {}", config.name, addr))?;

        Ok(Self {
            name: Arc::from(config.name.as_str()),
            listener,
            routes: Arc::new(routes),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires and in-flight requests are drained
    pub async fn serve(self, shutdown: Shutdown) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("[{}] Listening on http://{}", self.name, addr);
        }
        for route in &self.routes.0 {
            debug!("[{}] Serving {}", self.name, route.handler.url());
        }

        let routes = self.routes;
        listener::serve(self.listener, self.name, shutdown, move |req| {
            let routes = routes.clone();
            async move { routes.handle(req).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::REQUEST_TIMEOUT;
    use crate::stats::StatisticsCollector;
    use crate::test_client;
    use hyper::{Method, StatusCode};
    use mimicro_common::{MimicroConfig, QueryRecord};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    const CONFIG: &str = r#"
[[servers]]
name = "server_1"
bind_address = "127.0.0.1"
port = 0

[[servers.endpoints]]
url = "/simple_url"

[servers.endpoints.GET]
body = "{}"
content_type = "application/json"

[servers.endpoints.POST]
body = "OK"
status_code = 201

[[servers.endpoints]]
url = "/users/{name}"

[servers.endpoints.GET]
body = "file://users/{{.name}}.txt"

[[servers.endpoints]]
url = "/hello/{name}"

[servers.endpoints.GET]
body = "Hello {{.name}}"

[[servers.endpoints]]
url = "/response_from_file"

[servers.endpoints.GET]
body = "file://server_1_simple_response.json"
"#;

    fn fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn server_config() -> ServerConfig {
        MimicroConfig::from_toml(CONFIG).unwrap().servers.remove(0)
    }

    #[tokio::test]
    async fn test_serves_configured_endpoints() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();
        let server = ServerRuntime::bind(&server_config(), &fixtures(), Some(collector.handle()))
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        assert_eq!(server.name(), "server_1");

        let (trigger, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown));

        let (status, content_type, body) =
            test_client::send(Method::GET, &format!("{}/simple_url", base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(body, "{}");

        let (status, content_type, body) =
            test_client::send(Method::POST, &format!("{}/simple_url", base)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(body, "OK");

        let (status, content_type, body) =
            test_client::send(Method::PATCH, &format!("{}/simple_url", base)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        assert_eq!(body, "404 page not found\n");

        let (status, _, body) =
            test_client::send(Method::GET, &format!("{}/users/alice", base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello from alice\n");

        let (status, content_type, body) =
            test_client::send(Method::GET, &format!("{}/response_from_file", base)).await;
        let expected = std::fs::read_to_string(fixtures().join("server_1_simple_response.json"))
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(body, expected);

        trigger.send(true).unwrap();
        task.await.unwrap();
        collector.stop().await;

        let all = stats.query(&QueryRecord::any()).await;
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|entry| entry.count == 1));
        assert_eq!(
            stats.query(&QueryRecord::any().url("/users/{name}")).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_url_is_not_found_and_not_recorded() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();
        let server = ServerRuntime::bind(&server_config(), &fixtures(), Some(collector.handle()))
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());

        let (trigger, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown));

        let (status, _, body) = test_client::send(Method::GET, &format!("{}/nowhere", base)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 page not found\n");

        trigger.send(true).unwrap();
        task.await.unwrap();
        collector.stop().await;
        assert!(stats.query(&QueryRecord::any()).await.is_empty());
    }

    #[tokio::test]
    async fn test_path_variables_are_decoded() {
        let server = ServerRuntime::bind(&server_config(), &fixtures(), None)
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());

        let (trigger, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown));

        let (status, _, body) =
            test_client::send(Method::GET, &format!("{}/hello/john%20doe", base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello john doe");

        let (status, _, body) =
            test_client::send(Method::GET, &format!("{}/users/%61lice", base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello from alice\n");

        trigger.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_client_is_disconnected() {
        let dir = test_client::large_file_dir("stalled-client");
        let config = MimicroConfig::from_toml(test_client::LARGE_FILE_CONFIG)
            .unwrap()
            .servers
            .remove(0);
        let server = ServerRuntime::bind(&config, &dir, None).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (trigger, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown));

        let mut stream = test_client::raw_get(addr, "/large").await;
        tokio::time::sleep(REQUEST_TIMEOUT + Duration::from_secs(2)).await;

        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
            .await
            .expect("stalled connection was never closed");
        if read.is_ok() {
            assert!(received.len() < test_client::LARGE_FILE_SIZE);
            assert!(!test_client::is_complete_chunked(&received));
        }

        trigger.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_compile_errors_prevent_binding() {
        let mut config = server_config();
        config.endpoints[0].get.as_mut().unwrap().body =
            Some("file://missing.json".to_string());

        let err = match ServerRuntime::bind(&config, &fixtures(), None).await {
            Ok(_) => panic!("missing file must be rejected"),
            Err(e) => format!("{:#}", e),
        };
        assert!(err.contains("server 'server_1', url '/simple_url'"), "{}", err);
        assert!(err.contains("missing.json"), "{}", err);
    }
}
