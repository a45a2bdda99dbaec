//! Scripted provider for tests.
//!
//! Submissions return queued results in FIFO order, falling back to a fresh `mock-<n>` id. Status
//! polls return the queued statuses for a correlation id, falling back to `Pending`. Every call is
//! recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{JobProvider, JobSubmission, ProviderStatus, Result};

/// Record of a call made to the mock provider.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Submit(JobSubmission),
    FetchStatus(String),
    Cancel(String),
}

#[derive(Clone, Default)]
pub struct MockProvider {
    submit_results: Arc<Mutex<VecDeque<Result<String>>>>,
    statuses: Arc<Mutex<HashMap<String, VecDeque<Result<ProviderStatus>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    submit_delay: Arc<Mutex<Option<Duration>>>,
    webhooks: Arc<AtomicBool>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next submission.
    pub fn add_submit_result(&self, result: Result<String>) {
        self.submit_results.lock().push_back(result);
    }

    /// Queue a status for the next poll of `correlation_id`.
    pub fn add_status(&self, correlation_id: &str, status: Result<ProviderStatus>) {
        self.statuses
            .lock()
            .entry(correlation_id.to_string())
            .or_default()
            .push_back(status);
    }

    /// Make every submission sleep before answering.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = Some(delay);
    }

    /// Pretend completions are pushed by webhook, delaying the first poll by the grace period.
    pub fn set_delivers_webhooks(&self, enabled: bool) {
        self.webhooks.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| matches!(c, MockCall::Submit(_))).count()
    }
}

#[async_trait]
impl JobProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn delivers_webhooks(&self) -> bool {
        self.webhooks.load(Ordering::SeqCst)
    }

    async fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(MockCall::Submit(submission.clone()));
            calls.len()
        };
        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.submit_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("mock-{n}")))
    }

    async fn fetch_status(&self, correlation_id: &str) -> Result<ProviderStatus> {
        self.calls.lock().push(MockCall::FetchStatus(correlation_id.to_string()));
        self.statuses
            .lock()
            .get_mut(correlation_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(ProviderStatus::Pending))
    }

    async fn cancel(&self, correlation_id: &str) -> Result<()> {
        self.calls.lock().push(MockCall::Cancel(correlation_id.to_string()));
        Ok(())
    }
}
