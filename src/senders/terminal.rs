use std::io::Write;

use async_trait::async_trait;
use chrono::Local;

use crate::{
    senders::{SenderError, WarningSender, format_report, format_time},
    snapshot::ProcessUsage,
};

// Print warnings on the standard output
pub struct TerminalSender {
    machine_name: String,
}

impl TerminalSender {
    pub fn new(machine_name: &str) -> Self {
        Self {
            machine_name: machine_name.to_string(),
        }
    }
}

#[async_trait]
impl WarningSender for TerminalSender {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn send_warning(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
    ) -> Result<(), SenderError> {
        let time = format_time(&Local::now());
        let report = format_report(&self.machine_name, gpu_id, &time, processes);

        let mut stdout = std::io::stdout().lock();
        stdout.write_all(report.as_bytes())?;
        stdout.flush()?;

        Ok(())
    }
}
