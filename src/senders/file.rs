use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::{
    senders::{SenderError, WarningSender, format_report, format_time},
    snapshot::ProcessUsage,
};

// Append warnings to a log file, the file is created on first use
pub struct FileSender {
    machine_name: String,
    path: PathBuf,
}

impl FileSender {
    pub fn new(machine_name: &str, path: &Path) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl WarningSender for FileSender {
    fn name(&self) -> &str {
        "file"
    }

    async fn send_warning(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
    ) -> Result<(), SenderError> {
        let time = format_time(&Local::now());
        let report = format_report(&self.machine_name, gpu_id, &time, processes);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(report.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}
