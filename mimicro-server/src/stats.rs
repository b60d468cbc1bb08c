//! Request statistics collector
//!
//! Every write (recording a request, resetting matching records) goes
//! through one queue consumed by a single task. Queries read the table
//! directly under a read lock and never wait behind the queue.

use mimicro_common::{QueryRecord, ReceivedRequest, StatisticsEntry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Counter = HashMap<ReceivedRequest, u64>;

/// Statistics errors
#[derive(Debug, thiserror::Error)]
pub enum StatisticsError {
    #[error("statistics collector is stopped")]
    Stopped,
}

enum Command {
    Record(ReceivedRequest),
    Reset(QueryRecord, oneshot::Sender<usize>),
}

/// Cloneable access to a running collector: submit records, query, reset
#[derive(Clone)]
pub struct StatisticsHandle {
    store: Arc<RwLock<Counter>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl StatisticsHandle {
    /// Queue a served request. Never blocks; dropped once the collector stopped.
    pub fn record(&self, request: ReceivedRequest) {
        if self.commands.send(Command::Record(request)).is_err() {
            debug!("Statistics collector stopped, dropping record");
        }
    }

    /// Counts of all stored records matching `query`, one entry per stored record
    pub async fn query(&self, query: &QueryRecord) -> Vec<StatisticsEntry> {
        let store = self.store.read().await;
        let mut matching: Vec<_> = store
            .iter()
            .filter(|(request, _)| query.matches(request))
            .collect();
        matching.sort();

        matching
            .into_iter()
            .map(|(request, count)| StatisticsEntry::new(request, *count))
            .collect()
    }

    /// Delete all stored records matching `query`, returning how many were removed.
    ///
    /// The reset is applied after every record queued before it.
    pub async fn reset(&self, query: QueryRecord) -> Result<usize, StatisticsError> {
        let (done, deleted) = oneshot::channel();
        self.commands
            .send(Command::Reset(query, done))
            .map_err(|_| StatisticsError::Stopped)?;
        deleted.await.map_err(|_| StatisticsError::Stopped)
    }
}

/// Owner of the consuming task
pub struct StatisticsCollector {
    handle: StatisticsHandle,
    close: oneshot::Sender<()>,
    consumer: JoinHandle<()>,
}

impl StatisticsCollector {
    /// Open the queue and spawn the consumer
    pub fn start() -> Self {
        let store = Arc::new(RwLock::new(Counter::new()));
        let (commands, receiver) = mpsc::unbounded_channel();
        let (close, close_receiver) = oneshot::channel();

        info!("[Statistics] Starting...");
        let consumer = tokio::spawn(consume(store.clone(), receiver, close_receiver));

        Self {
            handle: StatisticsHandle { store, commands },
            close,
            consumer,
        }
    }

    pub fn handle(&self) -> StatisticsHandle {
        self.handle.clone()
    }

    /// Close the queue and wait until already queued commands are applied
    pub async fn stop(self) {
        let _ = self.close.send(());
        if let Err(e) = self.consumer.await {
            warn!("[Statistics] Consumer task failed: {}", e);
        }
    }
}

async fn consume(
    store: Arc<RwLock<Counter>>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut close => {
                receiver.close();
                break;
            }
            command = receiver.recv() => match command {
                Some(command) => apply(&store, command).await,
                None => break,
            },
        }
    }

    // After `close` the receiver still yields everything already buffered.
    while let Some(command) = receiver.recv().await {
        apply(&store, command).await;
    }

    info!("[Statistics] Stopped");
}

async fn apply(store: &RwLock<Counter>, command: Command) {
    match command {
        Command::Record(request) => {
            *store.write().await.entry(request).or_insert(0) += 1;
        }
        Command::Reset(query, done) => {
            let mut store = store.write().await;
            let before = store.len();
            store.retain(|request, _| !query.matches(request));
            let deleted = before - store.len();
            debug!("[Statistics] Reset {:?}, {} records deleted", query, deleted);
            let _ = done.send(deleted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(server: &str, url: &str, method: &str, status_code: u16) -> ReceivedRequest {
        ReceivedRequest {
            server_name: server.to_string(),
            url: url.to_string(),
            method: method.to_string(),
            status_code,
        }
    }

    fn entry(server: &str, url: &str, method: &str, count: u64) -> StatisticsEntry {
        StatisticsEntry {
            server: server.to_string(),
            url: url.to_string(),
            method: method.to_string(),
            count,
        }
    }

    #[tokio::test]
    async fn test_identical_requests_accumulate() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();

        let request = request("Simple server", "/some_url", "POST", 201);
        stats.record(request.clone());
        stats.record(request);
        collector.stop().await;

        assert_eq!(
            stats.query(&QueryRecord::any()).await,
            vec![entry("Simple server", "/some_url", "POST", 2)]
        );
    }

    #[tokio::test]
    async fn test_stop_drains_queued_records() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();

        for _ in 0..1000 {
            stats.record(request("s", "/", "GET", 200));
        }
        collector.stop().await;

        assert_eq!(stats.query(&QueryRecord::any()).await[0].count, 1000);
    }

    #[tokio::test]
    async fn test_stop_without_pending_records() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();
        collector.stop().await;

        assert!(stats.query(&QueryRecord::any()).await.is_empty());
        stats.record(request("s", "/", "GET", 200));
        assert!(matches!(
            stats.reset(QueryRecord::any()).await,
            Err(StatisticsError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_query_by_server_keeps_status_codes_apart() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();

        stats.record(request("server_1", "/a", "GET", 200));
        stats.record(request("server_1", "/a", "GET", 500));
        stats.record(request("server_1", "/b", "POST", 201));
        stats.record(request("server_2", "/a", "GET", 200));
        collector.stop().await;

        let result = stats.query(&QueryRecord::any().server("server_1")).await;
        assert_eq!(
            result,
            vec![
                entry("server_1", "/a", "GET", 1),
                entry("server_1", "/a", "GET", 1),
                entry("server_1", "/b", "POST", 1),
            ]
        );
        assert_eq!(stats.query(&QueryRecord::any()).await.len(), 4);
    }

    #[tokio::test]
    async fn test_reset_removes_only_matching_records() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();

        stats.record(request("server_1", "/a", "GET", 200));
        stats.record(request("server_1", "/a", "GET", 200));
        stats.record(request("server_1", "/b", "GET", 200));
        stats.record(request("server_2", "/a", "GET", 200));

        let deleted = stats
            .reset(QueryRecord::any().server("server_1").url("/a"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        assert!(stats
            .query(&QueryRecord::any().server("server_1").url("/a"))
            .await
            .is_empty());
        assert_eq!(
            stats.query(&QueryRecord::any()).await,
            vec![
                entry("server_1", "/b", "GET", 1),
                entry("server_2", "/a", "GET", 1),
            ]
        );

        assert_eq!(stats.reset(QueryRecord::any()).await.unwrap(), 2);
        assert!(stats.query(&QueryRecord::any()).await.is_empty());
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_counts_grow_again_after_reset() {
        let collector = StatisticsCollector::start();
        let stats = collector.handle();

        stats.record(request("s", "/", "GET", 200));
        stats.reset(QueryRecord::any()).await.unwrap();
        stats.record(request("s", "/", "GET", 200));
        collector.stop().await;

        assert_eq!(
            stats.query(&QueryRecord::any()).await,
            vec![entry("s", "/", "GET", 1)]
        );
    }
}
