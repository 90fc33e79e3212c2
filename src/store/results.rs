//! Finished-match results, delivered off the room task

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::game::Uid;

use super::supabase::SupabaseClient;
use super::tokens::StoreError;

/// One finished round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub match_id: String,
    /// `None` when nobody survived
    pub winner: Option<Uid>,
    pub timestamp: DateTime<Utc>,
}

impl MatchResult {
    pub fn new(match_id: String, winner: Option<Uid>) -> Self {
        Self {
            match_id,
            winner,
            timestamp: Utc::now(),
        }
    }
}

/// Where results end up
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &MatchResult) -> Result<(), StoreError>;
}

/// Inserts into the match_results table
pub struct SupabaseResultSink {
    client: SupabaseClient,
}

impl SupabaseResultSink {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultSink for SupabaseResultSink {
    async fn deliver(&self, result: &MatchResult) -> Result<(), StoreError> {
        self.client.insert("match_results", result).await?;
        Ok(())
    }
}

/// Writes results to the log only
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn deliver(&self, result: &MatchResult) -> Result<(), StoreError> {
        info!(
            match_id = %result.match_id,
            winner = ?result.winner,
            timestamp = %result.timestamp,
            "Match result"
        );
        Ok(())
    }
}

/// Non-blocking handoff from room tasks to the delivery worker
#[derive(Clone)]
pub struct ResultPublisher {
    tx: mpsc::UnboundedSender<MatchResult>,
}

impl ResultPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MatchResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, result: MatchResult) {
        if let Err(e) = self.tx.send(result) {
            warn!(match_id = %e.0.match_id, "Result worker gone, dropping match result");
        }
    }
}

/// Deliver results until every publisher is dropped. Failures are logged and
/// not retried.
pub async fn run_result_worker(
    mut rx: mpsc::UnboundedReceiver<MatchResult>,
    sink: Arc<dyn ResultSink>,
) {
    while let Some(result) = rx.recv().await {
        match sink.deliver(&result).await {
            Ok(()) => info!(match_id = %result.match_id, "Match result delivered"),
            Err(e) => warn!(match_id = %result.match_id, error = %e, "Failed to deliver match result"),
        }
    }
    info!("Result worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ResultSink for Recording {
        async fn deliver(&self, result: &MatchResult) -> Result<(), StoreError> {
            self.seen.lock().push(result.match_id.clone());
            if self.fail {
                return Err(StoreError::Unavailable("down".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_delivers_each_result_once() {
        let (publisher, rx) = ResultPublisher::channel();
        let sink = Recording::default();

        publisher.publish(MatchResult::new("a".to_string(), Some(1)));
        publisher.publish(MatchResult::new("b".to_string(), None));
        drop(publisher);

        run_result_worker(rx, Arc::new(sink.clone())).await;
        assert_eq!(*sink.seen.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn failures_are_not_retried() {
        let (publisher, rx) = ResultPublisher::channel();
        let sink = Recording {
            fail: true,
            ..Recording::default()
        };

        publisher.publish(MatchResult::new("a".to_string(), Some(1)));
        drop(publisher);

        run_result_worker(rx, Arc::new(sink.clone())).await;
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[test]
    fn results_serialize_for_the_results_table() {
        let result = MatchResult::new("lobby".to_string(), None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["match_id"], "lobby");
        assert!(json["winner"].is_null());
        assert!(json["timestamp"].is_string());
    }
}
