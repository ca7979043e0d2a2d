use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    attribution::attribute,
    collaborators::ProcessInspector,
    senders::{SenderError, WarningSender},
    snapshot::ProcessUsage,
};

#[derive(Debug)]
pub struct SenderFailure {
    pub sender: String,
    pub error: SenderError,
}

// Outcome of one dispatch, the names of the senders that succeeded
// and the errors of those that did not
#[derive(Debug)]
pub struct DispatchReport {
    pub gpu_id: u32,
    pub delivered: Vec<String>,
    pub failures: Vec<SenderFailure>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// Enrich the processes of an idle GPU and fan the warning out to
// every registered sender
pub struct Dispatcher {
    inspector: Arc<dyn ProcessInspector>,
    people: Vec<String>,

    // Invoked in registration order
    senders: Vec<Box<dyn WarningSender>>,
}

impl Dispatcher {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        people: Vec<String>,
        senders: Vec<Box<dyn WarningSender>>,
    ) -> Self {
        Self {
            inspector,
            people,
            senders,
        }
    }

    pub fn sender_names(&self) -> Vec<&str> {
        self.senders.iter().map(|sender| sender.name()).collect()
    }

    // Fill the command line, working directory and related people of
    // every process. A failed lookup leaves that field empty.
    pub async fn enrich(&self, processes: &mut [ProcessUsage]) {
        for process in processes.iter_mut() {
            let cmd = self
                .inspector
                .command_line(process.pid)
                .await
                .unwrap_or_else(|err| {
                    warn!("Command line lookup of PID {} failed: {}", process.pid, err);
                    String::new()
                });

            let pwd = self
                .inspector
                .working_dir(process.pid)
                .await
                .unwrap_or_else(|err| {
                    warn!("Working directory lookup of PID {} failed: {}", process.pid, err);
                    String::new()
                });

            let related = attribute(&cmd, &pwd, &self.people);

            debug!(
                "PID {}: cmd \"{}\", pwd \"{}\", related {:?}",
                process.pid, cmd, pwd, related
            );

            process.cmd = Some(cmd);
            process.pwd = Some(pwd);
            process.related_people = Some(related);
        }
    }

    pub async fn dispatch(
        &self,
        gpu_id: u32,
        mut processes: Vec<ProcessUsage>,
    ) -> DispatchReport {
        self.enrich(&mut processes).await;

        let mut report = DispatchReport {
            gpu_id,
            delivered: Vec::new(),
            failures: Vec::new(),
        };

        for sender in self.senders.iter() {
            match sender.send_warning(gpu_id, &processes).await {
                Ok(()) => {
                    report.delivered.push(sender.name().to_string());
                }
                Err(error) => {
                    warn!(
                        "Sender \"{}\" failed for GPU {}: {}",
                        sender.name(),
                        gpu_id,
                        error
                    );

                    report.failures.push(SenderFailure {
                        sender: sender.name().to_string(),
                        error,
                    });
                }
            }
        }

        info!(
            "Warning for GPU {} delivered by {:?}, {} sender(s) failed",
            gpu_id,
            report.delivered,
            report.failures.len()
        );

        report
    }
}
