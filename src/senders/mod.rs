use async_trait::async_trait;
use chrono::{DateTime, Local};
use thiserror::Error;

use crate::snapshot::ProcessUsage;

pub mod chat;
pub mod file;
pub mod terminal;

pub const RULER: &str =
    "================================================================";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Message rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("No credential available")]
    MissingCredential,
}

// A notification channel for idle GPU warnings
#[async_trait]
pub trait WarningSender: Send + Sync {
    // Short name used in logs and dispatch reports
    fn name(&self) -> &str;

    async fn send_warning(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
    ) -> Result<(), SenderError>;
}

pub fn format_time(time: &DateTime<Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn format_header(machine_name: &str, gpu_id: u32, time: &str) -> String {
    format!("[{machine_name}] Utilization 0% at GPU {gpu_id}, Time: {time}")
}

pub fn format_people(process: &ProcessUsage) -> String {
    let people: Vec<&str> = process
        .related_people
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();

    format!("{{{}}}", people.join(", "))
}

pub fn format_process(process: &ProcessUsage) -> String {
    format!(
        "- Related People: {}, PID: {}, GPU Memory: {}, PWD: {}, Command: {}",
        format_people(process),
        process.pid,
        process.gpu_memory,
        process.pwd.as_deref().unwrap_or_default(),
        process.cmd.as_deref().unwrap_or_default(),
    )
}

// Plain text report shared by the terminal and file senders
pub fn format_report(
    machine_name: &str,
    gpu_id: u32,
    time: &str,
    processes: &[ProcessUsage],
) -> String {
    let mut lines = vec![RULER.to_string(), format_header(machine_name, gpu_id, time)];
    lines.extend(processes.iter().map(format_process));

    let mut report = lines.join("\n");
    report.push('\n');
    report
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use super::*;

    pub(crate) fn enriched(
        pid: u32,
        memory: &str,
        cmd: &str,
        pwd: &str,
        people: &[&str],
    ) -> ProcessUsage {
        ProcessUsage {
            pid,
            gpu_memory: memory.to_string(),
            cmd: Some(cmd.to_string()),
            pwd: Some(pwd.to_string()),
            related_people: Some(
                people.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            ),
        }
    }

    #[test]
    fn report_lists_every_process() {
        let processes = vec![
            enriched(
                41234,
                "10240MiB",
                "python train.py",
                "/home/alice/proj",
                &["Alice Smith"],
            ),
            enriched(50001, "64MiB", "./bench", "/tmp", &[]),
        ];

        let report =
            format_report("dgx-01", 3, "2026-10-15 10:00:00", &processes);

        assert_eq!(
            report,
            "================================================================\n\
             [dgx-01] Utilization 0% at GPU 3, Time: 2026-10-15 10:00:00\n\
             - Related People: {Alice Smith}, PID: 41234, GPU Memory: 10240MiB, PWD: /home/alice/proj, Command: python train.py\n\
             - Related People: {}, PID: 50001, GPU Memory: 64MiB, PWD: /tmp, Command: ./bench\n"
        );
    }

    #[test]
    fn missing_lookups_render_empty() {
        let process = ProcessUsage::new(7, "1MiB");

        assert_eq!(
            format_process(&process),
            "- Related People: {}, PID: 7, GPU Memory: 1MiB, PWD: , Command: "
        );
    }
}
