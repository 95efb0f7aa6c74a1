//! Execution engine reached over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{ExecutionEngine, Runnable};
use crate::store::{Check, CheckOutcome, CheckStore};

/// Errors submitting a check to the executor.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request could not be sent or its response read.
    #[error("executor request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The executor did not answer within the check's timeout.
    #[error("check timed out after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),

    /// The executor answered with a non-success status.
    #[error("executor rejected check with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Posts each check to `{executor_url}/v1/checks` and finishes it according to
/// the response. A check whose request outlives its plan's timeout errors.
#[derive(Clone)]
pub struct HttpEngine {
    client: reqwest::Client,
    executor_url: String,
    store: Arc<dyn CheckStore>,
}

impl HttpEngine {
    /// Create an engine with a default client.
    pub fn new(executor_url: impl Into<String>, store: Arc<dyn CheckStore>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, executor_url, store))
    }

    pub fn with_client(
        client: reqwest::Client,
        executor_url: impl Into<String>,
        store: Arc<dyn CheckStore>,
    ) -> Self {
        Self {
            client,
            executor_url: executor_url.into().trim_end_matches('/').to_string(),
            store,
        }
    }
}

impl ExecutionEngine for HttpEngine {
    fn new_check(&self, check: Check) -> Box<dyn Runnable> {
        Box::new(HttpRunnable {
            engine: self.clone(),
            check,
        })
    }
}

struct HttpRunnable {
    engine: HttpEngine,
    check: Check,
}

impl HttpRunnable {
    async fn submit(&self) -> Result<(), EngineError> {
        let url = format!("{}/v1/checks", self.engine.executor_url);
        let timeout = self.check.plan.timeout;
        let response = self
            .engine
            .client
            .post(&url)
            .timeout(timeout)
            .json(&self.check)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::TimedOut(timeout)
                } else {
                    EngineError::Transport(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Runnable for HttpRunnable {
    async fn run(self: Box<Self>) {
        let id = self.check.id;

        let outcome = match self.submit().await {
            Ok(()) => {
                debug!(check = %id, checkable = %self.check.checkable_name, "Check succeeded");
                CheckOutcome::Succeeded
            }
            Err(e) => {
                warn!(check = %id, checkable = %self.check.checkable_name, error = %e, "Check failed");
                CheckOutcome::Errored(e.to_string())
            }
        };

        if let Err(e) = self.engine.store.finish_check(id, outcome).await {
            error!(check = %id, error = %e, "Failed to finish check");
        }
    }
}
