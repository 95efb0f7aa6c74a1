//! Runs the scan and check loops side by side.

use std::time::Duration;

use lookout_pacing::{IntervalRunner, DEFAULT_CHECKER_INTERVAL, DEFAULT_SCANNER_INTERVAL};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument};

use super::{Checker, Scanner};

/// Loop intervals.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub scan_interval: Duration,
    pub check_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCANNER_INTERVAL,
            check_interval: DEFAULT_CHECKER_INTERVAL,
        }
    }
}

/// Owns the scanner and checker for the lifetime of the process.
pub struct Orchestrator {
    scanner: Scanner,
    checker: Checker,
    config: OrchestratorConfig,
    check_notifications: mpsc::Receiver<()>,
}

impl Orchestrator {
    /// Create an orchestrator. `check_notifications` wakes the check loop
    /// early, typically after a scan creates checks.
    pub fn new(
        scanner: Scanner,
        checker: Checker,
        config: OrchestratorConfig,
        check_notifications: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            scanner,
            checker,
            config,
            check_notifications,
        }
    }

    /// Run both loops until shutdown is signaled; both stop together.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            check_interval_secs = self.config.check_interval.as_secs(),
            "Starting check orchestrator"
        );

        let scan = tokio::spawn(
            IntervalRunner::new(self.scanner, self.config.scan_interval).run(shutdown.clone()),
        );
        let check = tokio::spawn(
            IntervalRunner::new(self.checker, self.config.check_interval)
                .with_notifier(self.check_notifications)
                .run(shutdown),
        );

        let (scan, check) = tokio::join!(scan, check);
        for (runner, result) in [("scanner", scan), ("checker", check)] {
            if let Err(e) = result {
                error!(runner, error = %e, "Runner task failed");
            }
        }

        info!("Check orchestrator stopped");
    }
}
