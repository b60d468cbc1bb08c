//! Process coordinator: starts every runtime and brings them down together

use crate::listener::GRACE_PERIOD;
use crate::management::ManagementRuntime;
use crate::server::{Routes, ServerRuntime};
use crate::stats::StatisticsCollector;
use anyhow::Result;
use mimicro_common::MimicroConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Extra time granted to runtimes on top of their own grace period
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Compile every endpoint of every server without binding anything
pub fn check(config: &MimicroConfig, base_dir: &Path) -> Result<()> {
    config.validate()?;
    for server in &config.servers {
        Routes::compile(server, base_dir, None)?;
    }
    Ok(())
}

/// All runtimes of the process, bound and ready to serve
pub struct Coordinator {
    collector: Option<StatisticsCollector>,
    servers: Vec<ServerRuntime>,
    management: ManagementRuntime,
}

impl Coordinator {
    /// Start the statistics collector if enabled, then compile and bind
    /// every listener. Nothing is served until [`Coordinator::run`].
    pub async fn bind(config: &MimicroConfig, base_dir: &Path) -> Result<Self> {
        let collector = config
            .collect_statistics
            .then(StatisticsCollector::start);
        let statistics = collector.as_ref().map(StatisticsCollector::handle);

        let bound = async {
            let mut servers = Vec::with_capacity(config.servers.len());
            for server in &config.servers {
                servers.push(ServerRuntime::bind(server, base_dir, statistics.clone()).await?);
            }
            let management = ManagementRuntime::bind(&config.management, statistics.clone()).await?;
            Ok::<_, anyhow::Error>((servers, management))
        }
        .await;

        match bound {
            Ok((servers, management)) => Ok(Self {
                collector,
                servers,
                management,
            }),
            Err(e) => {
                if let Some(collector) = collector {
                    collector.stop().await;
                }
                Err(e)
            }
        }
    }

    pub fn server_addr(&self, name: &str) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|server| server.name() == name)
            .and_then(|server| server.local_addr().ok())
    }

    pub fn management_addr(&self) -> Result<SocketAddr> {
        self.management.local_addr()
    }

    /// Serve until `signal` resolves, then shut every listener down within
    /// the grace period and drain the statistics queue.
    pub async fn run(self, signal: impl Future<Output = ()>) -> Result<()> {
        let (trigger, shutdown) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for server in self.servers {
            let shutdown = shutdown.clone();
            tasks.spawn(server.serve(shutdown));
        }
        tasks.spawn(self.management.serve(shutdown));

        tokio::select! {
            _ = signal => info!("Received shutdown signal"),
            _ = join_all(&mut tasks) => warn!("All listeners stopped unexpectedly"),
        }

        let _ = trigger.send(true);
        if tokio::time::timeout(GRACE_PERIOD + SHUTDOWN_SLACK, join_all(&mut tasks))
            .await
            .is_err()
        {
            warn!(
                "Shutdown error: {} listeners did not stop within {:?}, aborting them",
                tasks.len(),
                GRACE_PERIOD
            );
            tasks.abort_all();
        }

        if let Some(collector) = self.collector {
            collector.stop().await;
        }

        info!("Mimicro successfully down");
        Ok(())
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Listener task failed: {}", e);
        }
    }
}
