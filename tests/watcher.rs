use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use gpu_idle_warden::{
    collaborators::{CollaboratorError, GpuQuery, ProcessInspector},
    dispatcher::Dispatcher,
    errors::WardenError,
    idle_tracker::IdleTracker,
    senders::{SenderError, WarningSender},
    snapshot::{PROCESS_TABLE_SEPARATOR, ProcessUsage},
    watcher::{TickOutcome, Watcher},
};
use tokio_util::sync::CancellationToken;

fn unavailable() -> CollaboratorError {
    CollaboratorError::Spawn {
        command: "nvidia-smi".to_string(),
        error: std::io::Error::other("not installed"),
    }
}

// Replays scripted utilization reports, one per tick
struct ScriptedQuery {
    utilization: Mutex<VecDeque<Result<String, ()>>>,
    process_table: Mutex<Result<String, ()>>,
    process_table_calls: Mutex<usize>,
}

impl ScriptedQuery {
    fn new(ticks: &[&str], process_table: &str) -> Arc<Self> {
        Arc::new(Self {
            utilization: Mutex::new(
                ticks.iter().map(|t| Ok(t.to_string())).collect(),
            ),
            process_table: Mutex::new(Ok(process_table.to_string())),
            process_table_calls: Mutex::new(0),
        })
    }

    fn push_failure(&self) {
        self.utilization.lock().unwrap().push_back(Err(()));
    }

    fn push(&self, tick: &str) {
        self.utilization.lock().unwrap().push_back(Ok(tick.to_string()));
    }

    fn set_process_table(&self, table: Result<String, ()>) {
        *self.process_table.lock().unwrap() = table;
    }

    fn process_table_calls(&self) -> usize {
        *self.process_table_calls.lock().unwrap()
    }
}

#[async_trait]
impl GpuQuery for ScriptedQuery {
    async fn utilization(&self) -> Result<String, CollaboratorError> {
        self.utilization
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(()))
            .map_err(|_| unavailable())
    }

    async fn process_table(&self) -> Result<String, CollaboratorError> {
        *self.process_table_calls.lock().unwrap() += 1;
        self.process_table.lock().unwrap().clone().map_err(|_| unavailable())
    }
}

struct StaticInspector;

#[async_trait]
impl ProcessInspector for StaticInspector {
    async fn command_line(&self, pid: u32) -> Result<String, CollaboratorError> {
        Ok(format!("python job_{pid}.py"))
    }

    async fn working_dir(&self, pid: u32) -> Result<String, CollaboratorError> {
        match pid {
            100 => Ok("/home/alice/exp".to_string()),
            _ => Err(unavailable()),
        }
    }
}

type Sent = Arc<Mutex<Vec<(String, u32, Vec<ProcessUsage>)>>>;

struct Recorder {
    name: &'static str,
    fail: bool,
    sent: Sent,
}

#[async_trait]
impl WarningSender for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn send_warning(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
    ) -> Result<(), SenderError> {
        self.sent
            .lock()
            .unwrap()
            .push((self.name.to_string(), gpu_id, processes.to_vec()));

        if self.fail {
            return Err(SenderError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn process_table(rows: &[&str]) -> String {
    let mut table = String::from("| Processes:     |\n");
    table.push_str(PROCESS_TABLE_SEPARATOR);
    table.push('\n');
    for row in rows {
        table.push_str(row);
        table.push('\n');
    }
    table.push_str("+----------------------------------------------------+\n");
    table
}

const GPU0_JOB: &str =
    "|    0   N/A  N/A       100      C   python                     2048MiB |";
const GPU1_JOB: &str =
    "|    1   N/A  N/A       200      C   python                      512MiB |";
const GPU1_XORG: &str =
    "|    1   N/A  N/A       300      G   /usr/lib/xorg/Xorg            4MiB |";

fn watcher(query: Arc<ScriptedQuery>, sent: &Sent, failing_first: bool) -> Watcher {
    let senders: Vec<Box<dyn WarningSender>> = vec![
        Box::new(Recorder {
            name: "flaky",
            fail: failing_first,
            sent: sent.clone(),
        }),
        Box::new(Recorder {
            name: "steady",
            fail: false,
            sent: sent.clone(),
        }),
    ];

    let dispatcher = Dispatcher::new(
        Arc::new(StaticInspector),
        vec!["Alice Smith".to_string(), "Bob Jones".to_string()],
        senders,
    );

    Watcher::new(
        query,
        IdleTracker::new(10, 30, 60),
        dispatcher,
        vec!["/usr/lib/xorg/Xorg".to_string()],
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn idle_gpu_is_reported_once_per_cool_down() {
    let query = ScriptedQuery::new(&[], &process_table(&[GPU0_JOB, GPU1_JOB]));
    for _ in 0..9 {
        query.push("0, 0 %\n1, 87 %");
    }

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query.clone(), &sent, false);

    let mut alerts = Vec::new();
    for tick in 1..=9 {
        let outcome = watcher.tick().await.unwrap();
        if !outcome.alerted.is_empty() {
            alerts.push((tick, outcome.alerted));
        }
    }

    assert_eq!(alerts, vec![(3, vec![0]), (9, vec![0])]);

    // The process table is only read on ticks with an eligible GPU
    assert_eq!(query.process_table_calls(), 2);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 4);

    let (name, gpu_id, processes) = &sent[0];
    assert_eq!(name, "flaky");
    assert_eq!(*gpu_id, 0);
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid, 100);
    assert_eq!(processes[0].gpu_memory, "2048MiB");
    assert_eq!(processes[0].cmd.as_deref(), Some("python job_100.py"));
    assert_eq!(processes[0].pwd.as_deref(), Some("/home/alice/exp"));
    assert_eq!(
        processes[0].related_people.as_ref().unwrap().iter().collect::<Vec<_>>(),
        vec!["Alice Smith"]
    );
}

#[tokio::test]
async fn sender_failure_still_starts_cool_down() {
    let query = ScriptedQuery::new(
        &["0, 0 %", "0, 0 %", "0, 0 %", "0, 0 %"],
        &process_table(&[GPU0_JOB]),
    );
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query, &sent, true);

    watcher.tick().await.unwrap();
    watcher.tick().await.unwrap();
    let outcome = watcher.tick().await.unwrap();
    assert_eq!(outcome.alerted, vec![0]);
    assert_eq!(outcome.failed_senders, vec![(0, "flaky".to_string())]);

    let names: Vec<String> =
        sent.lock().unwrap().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names, vec!["flaky", "steady"]);

    assert_eq!(
        watcher.tracker().state(0).unwrap().seconds_since_last_alert,
        0.
    );
    assert!(watcher.tick().await.unwrap().alerted.is_empty());
}

#[tokio::test]
async fn gpu_without_processes_restarts_idle_count() {
    // GPU 1 only runs the display server
    let query = ScriptedQuery::new(
        &["0, 3 %\n1, 0 %"; 6],
        &process_table(&[GPU0_JOB, GPU1_XORG]),
    );
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query, &sent, false);

    let mut outcomes = Vec::new();
    for _ in 0..6 {
        outcomes.push(watcher.tick().await.unwrap());
    }

    assert_eq!(
        outcomes[2],
        TickOutcome {
            eligible: vec![1],
            alerted: vec![],
            reset: vec![1],
            failed_senders: vec![],
        }
    );
    assert_eq!(outcomes[5].reset, vec![1]);
    assert!(sent.lock().unwrap().is_empty());

    // No alert was sent, the cool-down never started
    let state = watcher.tracker().state(1).unwrap();
    assert!(state.seconds_since_last_alert.is_infinite());
}

#[tokio::test]
async fn malformed_process_table_counts_as_no_processes() {
    let query = ScriptedQuery::new(
        &["0, 0 %"; 3],
        &process_table(&["|    0     100      C   python train.py --fast     2048MiB |"]),
    );
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query, &sent, false);

    watcher.tick().await.unwrap();
    watcher.tick().await.unwrap();
    let outcome = watcher.tick().await.unwrap();

    assert_eq!(outcome.reset, vec![0]);
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_queries_drop_the_tick_only() {
    let query = ScriptedQuery::new(&["0, 0 %", "0, 0 %"], &process_table(&[GPU0_JOB]));
    query.push_failure();
    query.push("0, 0 % extra, 5");
    query.push("0, 0 %");
    query.push("0, 0 %\n1, 0 %");
    query.push("0, 0 %");

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query.clone(), &sent, false);

    watcher.tick().await.unwrap();
    watcher.tick().await.unwrap();

    assert!(matches!(
        watcher.tick().await,
        Err(WardenError::Collaborator(_))
    ));
    assert!(matches!(watcher.tick().await, Err(WardenError::Snapshot(_))));
    assert_eq!(
        watcher.tracker().state(0).unwrap().idle_seconds_accumulated,
        20.
    );

    // Process table unavailable while eligible: nothing sent, retried
    query.set_process_table(Err(()));
    assert!(matches!(
        watcher.tick().await,
        Err(WardenError::Collaborator(_))
    ));
    assert!(sent.lock().unwrap().is_empty());
    assert_eq!(
        watcher.tracker().state(0).unwrap().idle_seconds_accumulated,
        20.
    );

    assert!(matches!(watcher.tick().await, Err(WardenError::Tracker(_))));

    query.set_process_table(Ok(process_table(&[GPU0_JOB])));
    assert_eq!(watcher.tick().await.unwrap().alerted, vec![0]);
}

#[tokio::test]
async fn failed_process_table_leaves_counters_untouched() {
    let query = ScriptedQuery::new(
        &["0, 0 %\n1, 0 %", "0, 0 %\n1, 0 %"],
        &process_table(&[GPU0_JOB]),
    );
    for _ in 0..2 {
        query.push("0, 0 %\n1, 40 %");
    }

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query.clone(), &sent, false);

    watcher.tick().await.unwrap();
    watcher.tick().await.unwrap();

    let before = [
        watcher.tracker().state(0).unwrap(),
        watcher.tracker().state(1).unwrap(),
    ];
    assert_eq!(before[0].idle_seconds_accumulated, 20.);
    assert_eq!(before[1].idle_seconds_accumulated, 20.);

    // GPU 0 becomes eligible and GPU 1 busy, but the table is unavailable
    query.set_process_table(Err(()));
    for _ in 0..2 {
        assert!(matches!(
            watcher.tick().await,
            Err(WardenError::Collaborator(_))
        ));

        let after = [
            watcher.tracker().state(0).unwrap(),
            watcher.tracker().state(1).unwrap(),
        ];
        assert_eq!(after, before);
    }

    assert_eq!(query.process_table_calls(), 2);
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_keeps_going_after_errors_and_stops_on_cancel() {
    let query = ScriptedQuery::new(&[], &process_table(&[GPU0_JOB]));
    query.push_failure();
    for _ in 0..4 {
        query.push("0, 0 %");
    }

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let mut watcher = watcher(query, &sent, false);
    let token = CancellationToken::new();

    let handle = {
        let token = token.clone();
        tokio::spawn(async move {
            watcher.run(token).await;
        })
    };

    // Ticks at 0s (failure), 10s, 20s and 30s (alert)
    tokio::time::sleep(Duration::from_secs(35)).await;
    token.cancel();
    handle.await.unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, 0);
}
