use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    collaborators::GpuQuery,
    dispatcher::Dispatcher,
    errors::WardenError,
    idle_tracker::IdleTracker,
    snapshot::{parse_process_table, parse_utilization},
};

// What happened to the GPUs during one tick
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    // GPUs idle long enough and out of cool-down
    pub eligible: Vec<u32>,
    // Eligible GPUs a warning was dispatched for
    pub alerted: Vec<u32>,
    // Eligible GPUs without any reportable process
    pub reset: Vec<u32>,
    // (GPU, sender name) of every failed delivery
    pub failed_senders: Vec<(u32, String)>,
}

// The poll loop: query the GPUs every check period, feed the idle
// tracker and dispatch warnings for the GPUs it selects
pub struct Watcher {
    gpu_query: Arc<dyn GpuQuery>,
    tracker: IdleTracker,
    dispatcher: Dispatcher,

    excluded_processes: Vec<String>,
    check_period: Duration,
}

impl Watcher {
    pub fn new(
        gpu_query: Arc<dyn GpuQuery>,
        tracker: IdleTracker,
        dispatcher: Dispatcher,
        excluded_processes: Vec<String>,
        check_period: Duration,
    ) -> Self {
        Self {
            gpu_query,
            tracker,
            dispatcher,
            excluded_processes,
            check_period,
        }
    }

    pub fn tracker(&self) -> &IdleTracker {
        &self.tracker
    }

    // Run ticks until the token is cancelled. A failed tick is logged
    // and the next one runs after the usual period.
    pub async fn run(&mut self, run_token: CancellationToken) {
        info!(
            "Watcher: Running every {:?}, senders {:?}",
            self.check_period,
            self.dispatcher.sender_names()
        );

        loop {
            match self.tick().await {
                Ok(outcome) => {
                    if outcome.failed_senders.is_empty() {
                        debug!("Tick done: {:?}", outcome);
                    } else {
                        warn!(
                            "Tick done with failed deliveries {:?}: {:?}",
                            outcome.failed_senders, outcome
                        );
                    }
                }
                Err(err) => {
                    let err = anyhow::Error::from(err);
                    error!("Tick dropped: {}", err);

                    err.chain().skip(1).for_each(|e| {
                        debug!("Error chain: {}", e);
                    });
                }
            }

            select! {
                _ = run_token.cancelled() => {
                    info!("Watcher: Quiting");

                    break;
                },
                _ = tokio::time::sleep(self.check_period) => {}
            }
        }
    }

    pub async fn tick(&mut self) -> Result<TickOutcome, WardenError> {
        let utilization = self.gpu_query.utilization().await?;
        let samples = parse_utilization(&utilization)?;

        // A tick failing after this point leaves the counters as they were
        let previous = self.tracker.clone();

        let mut outcome = TickOutcome {
            eligible: self.tracker.observe(&samples)?,
            ..Default::default()
        };

        if outcome.eligible.is_empty() {
            return Ok(outcome);
        }

        // Only query the process table when something may be reported
        let table = match self.gpu_query.process_table().await {
            Ok(table) => table,
            Err(err) => {
                self.tracker = previous;
                return Err(err.into());
            }
        };
        let mut processes =
            match parse_process_table(&table, &self.excluded_processes) {
                Ok(processes) => processes,
                Err(err) => {
                    warn!("Ignoring process table: {}", err);
                    HashMap::new()
                }
            };

        for gpu_id in outcome.eligible.clone() {
            match processes.remove(&gpu_id) {
                Some(gpu_processes) if !gpu_processes.is_empty() => {
                    info!(
                        "GPU {} idle with {} process(es), sending warning",
                        gpu_id,
                        gpu_processes.len()
                    );

                    // Sender failures still start the cool-down
                    let report =
                        self.dispatcher.dispatch(gpu_id, gpu_processes).await;
                    if !report.is_complete() {
                        outcome.failed_senders.extend(
                            report
                                .failures
                                .into_iter()
                                .map(|failure| (gpu_id, failure.sender)),
                        );
                    }

                    self.tracker.record_alert(gpu_id)?;
                    outcome.alerted.push(gpu_id);
                }
                _ => {
                    debug!("GPU {} idle without processes, restarting count", gpu_id);

                    self.tracker.reset_idle(gpu_id)?;
                    outcome.reset.push(gpu_id);
                }
            }
        }

        Ok(outcome)
    }
}
