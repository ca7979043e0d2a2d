use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

// Separator line that opens the process table of the nvidia-smi report.
// The GPU table uses a separator containing '+' so only the process
// table matches this exact string.
pub const PROCESS_TABLE_SEPARATOR: &str = "|=======================================================================================|";

// Positional layout of a process table row once the '|' borders are removed:
//
//   GPU  GI   CI   PID   Type  Process name ...  GPU Memory
//   0    N/A  N/A  4123  C     python train.py   10240MiB
//
// Any change of this layout must make parsing fail rather than produce
// a row with the wrong pid.
pub const ROW_GPU_COLUMN: usize = 0;
pub const ROW_PID_COLUMN: usize = 3;
pub const ROW_NAME_FIRST_COLUMN: usize = 5;
pub const ROW_MIN_TOKENS: usize = 6;

// Default list of process names that never belong to a user workload
pub const DEFAULT_EXCLUDED_PROCESSES: &[&str] = &["/usr/lib/xorg/Xorg"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Malformed GPU snapshot at line {line}: {reason}")]
    MalformedSnapshot { line: usize, reason: String },
    #[error("Malformed process table row \"{row}\": {reason}")]
    MalformedProcessTable { row: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuUtilizationSample {
    pub gpu_id: u32,
    pub utilization_percent: u8,
}

// A process holding memory on a GPU. The lookup fields are only
// filled for processes that are about to be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessUsage {
    pub pid: u32,
    pub gpu_memory: String,

    pub cmd: Option<String>,
    pub pwd: Option<String>,
    pub related_people: Option<BTreeSet<String>>,
}

impl ProcessUsage {
    pub fn new(pid: u32, gpu_memory: &str) -> Self {
        Self {
            pid,
            gpu_memory: gpu_memory.to_string(),
            cmd: None,
            pwd: None,
            related_people: None,
        }
    }
}

// Parse the output of
// `nvidia-smi --query-gpu=index,utilization.gpu --format=csv,noheader`.
// The returned order is the line order, it is never sorted.
pub fn parse_utilization(
    text: &str,
) -> Result<Vec<GpuUtilizationSample>, SnapshotError> {
    let mut samples = Vec::new();
    let mut seen = HashSet::new();

    for (number, line) in text.lines().enumerate() {
        let line_number = number + 1;
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        let malformed = |reason: String| SnapshotError::MalformedSnapshot {
            line: line_number,
            reason,
        };

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 2 {
            return Err(malformed(format!(
                "expected 2 fields, found {} in \"{line}\"",
                fields.len()
            )));
        }

        let gpu_id: u32 = fields[0].parse().map_err(|_| {
            malformed(format!("invalid GPU index \"{}\"", fields[0]))
        })?;

        let percent = fields[1].trim_end_matches('%').trim_end();
        let utilization_percent: u8 = match percent.parse::<u8>() {
            Ok(value) if value <= 100 => value,
            _ => {
                return Err(malformed(format!(
                    "invalid utilization \"{}\"",
                    fields[1]
                )));
            }
        };

        if !seen.insert(gpu_id) {
            return Err(malformed(format!("GPU index {gpu_id} repeated")));
        }

        samples.push(GpuUtilizationSample {
            gpu_id,
            utilization_percent,
        });
    }

    if samples.is_empty() {
        return Err(SnapshotError::MalformedSnapshot {
            line: 0,
            reason: "no GPU reported".to_string(),
        });
    }

    Ok(samples)
}

// Parse the process table at the end of the plain `nvidia-smi` report
// and group the processes by GPU index.
//
// A report without the process table separator has no processes,
// this is not an error.
pub fn parse_process_table(
    text: &str,
    excluded: &[String],
) -> Result<HashMap<u32, Vec<ProcessUsage>>, SnapshotError> {
    let mut processes: HashMap<u32, Vec<ProcessUsage>> = HashMap::new();

    let Some(start) = text.rfind(PROCESS_TABLE_SEPARATOR) else {
        return Ok(processes);
    };

    let lines: Vec<&str> = text[start..].trim().lines().collect();

    // Drop the separator and the closing border of the table
    let rows = match lines.len() {
        0..=2 => &[][..],
        n => &lines[1..n - 1],
    };

    for raw in rows {
        let row = raw.replace('|', "");
        let row = row.trim();

        let tokens: Vec<&str> = row.split_whitespace().collect();

        // Header rows and "No running processes found"
        let Some(first) = tokens.first() else {
            continue;
        };
        if !first.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let malformed = |reason: &str| SnapshotError::MalformedProcessTable {
            row: row.to_string(),
            reason: reason.to_string(),
        };

        if tokens.len() < ROW_MIN_TOKENS {
            return Err(malformed("too few columns"));
        }

        let last = tokens.len() - 1;
        let name = tokens[ROW_NAME_FIRST_COLUMN..last].join(" ");
        if excluded.iter().any(|pattern| name.contains(pattern.as_str())) {
            continue;
        }

        let gpu_id: u32 = tokens[ROW_GPU_COLUMN]
            .parse()
            .map_err(|_| malformed("GPU column is not an index"))?;

        let pid = match tokens[ROW_PID_COLUMN].parse::<u32>() {
            Ok(pid) if pid > 0 => pid,
            _ => return Err(malformed("PID column is not a process id")),
        };

        processes
            .entry(gpu_id)
            .or_default()
            .push(ProcessUsage::new(pid, tokens[last]));
    }

    Ok(processes)
}

// Parse the output of `ps -o cmd fp <pid>`. The first line is the
// header, so a single line means the process no longer exists.
pub fn parse_command_line(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() < 2 {
        return String::new();
    }

    lines[lines.len() - 1].to_string()
}

// Parse the output of `pwdx <pid>`, formatted as "<pid>: <path>"
pub fn parse_working_dir(text: &str) -> String {
    text.trim()
        .split_once(": ")
        .map(|(_, path)| path.to_string())
        .unwrap_or_default()
}
