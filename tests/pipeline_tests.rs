// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Format, Yaml};
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use weblogicbeat::event::LogEvent;
use weblogicbeat::init::agent::Agent;
use weblogicbeat::init::config::AgentConfig;
use weblogicbeat::init::wait::BoxError;
use weblogicbeat::offsets::persistence::{INPUT_SCOPE, load_offsets};
use weblogicbeat::offsets::JsonFileDatabase;
use weblogicbeat::shutdown::ShutdownState;
use weblogicbeat::sinks::{Sink, SinkError};

#[derive(Clone, Copy)]
enum Behavior {
    Accept,
    Reject,
    Hang,
}

#[derive(Clone)]
struct CollectingSink {
    events: Arc<Mutex<Vec<LogEvent>>>,
    behavior: Behavior,
}

impl CollectingSink {
    fn new(behavior: Behavior) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            behavior,
        }
    }

    fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..500 {
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} events, got {:?}", count, self.messages());
    }
}

impl Sink for CollectingSink {
    fn name(&self) -> &'static str {
        "collecting"
    }

    fn deliver<'a>(&'a mut self, events: &'a [LogEvent]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            match self.behavior {
                Behavior::Accept => {
                    self.events.lock().unwrap().extend_from_slice(events);
                    Ok(())
                }
                Behavior::Reject => Err(SinkError::Unavailable("backend down".to_string())),
                Behavior::Hang => futures::future::pending().await,
            }
        })
    }
}

fn config(dir: &Path, extra: &str) -> AgentConfig {
    let yaml = format!(
        r#"
paths: ["{logs}/*.log"]
scan_frequency: 50ms
watch_mode: poll
harvester:
  read_interval: 20ms
multiline:
  timeout: 100ms
output:
  flush_interval: 20ms
registry:
  flush: 50ms
path:
  data: "{data}"
{extra}
"#,
        logs = dir.join("logs").display(),
        data = dir.join("data").display(),
    );
    AgentConfig::from_figment(Figment::new().merge(Yaml::string(&yaml))).unwrap()
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<ShutdownState, BoxError>>,
}

impl Running {
    async fn start(config: AgentConfig, sink: CollectingSink) -> Self {
        let agent = Agent::new(config)
            .with_sink(Box::new(sink))
            .with_host("wls-test");
        let mut ready = agent.readiness().subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), ready.wait_for(|r| *r))
            .await
            .expect("agent never became ready")
            .unwrap();
        Self { cancel, handle }
    }

    async fn stop(self) -> ShutdownState {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("agent did not stop")
            .unwrap()
            .unwrap()
    }
}

fn append(path: &Path, data: &str) {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(data.as_bytes()).unwrap();
}

const RECORD_A: &str = "####<Oct 18, 2026 10:00:00 AM UTC> <Error> <HTTP> <wls01> <AdminServer> <BEA-101020> <Servlet failed>\njava.lang.NullPointerException\n\tat com.example.Foo.bar(Foo.java:42)\n";
const RECORD_B: &str = "####<Oct 18, 2026 10:00:01 AM UTC> <Info> <Server> <wls01> <AdminServer> <BEA-000360> <Server started in RUNNING mode>\n";
const RECORD_C: &str = "####<Oct 18, 2026 10:00:02 AM UTC> <Notice> <Server> <wls01> <AdminServer> <BEA-000365> <Server state changed>\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multiline_records_and_resume() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    let log = dir.path().join("logs").join("AdminServer.log");
    append(&log, RECORD_A);
    append(&log, RECORD_B);

    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), ""), sink.clone()).await;
    let messages = sink.wait_for(2).await;
    assert_eq!(messages[0], RECORD_A.trim_end());
    assert_eq!(messages[1], RECORD_B.trim_end());
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
    assert!(dir.path().join("data").join("registry.json").exists());

    // a restart only ships what was appended while stopped
    append(&log, RECORD_C);
    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), ""), sink.clone()).await;
    let messages = sink.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.messages(), vec![RECORD_C.trim_end().to_string()]);
    assert_eq!(messages[0], RECORD_C.trim_end());
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
}

fn registry_files(dir: &Path) -> usize {
    let db = JsonFileDatabase::open(dir.join("data").join("registry.json")).unwrap();
    load_offsets(&mut db.persister(INPUT_SCOPE)).unwrap().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_keeps_registry_entry() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    let admin = dir.path().join("logs").join("AdminServer.log");
    let managed = dir.path().join("logs").join("managed01.log");
    append(&admin, RECORD_A);
    append(&managed, RECORD_B);

    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), ""), sink.clone()).await;
    sink.wait_for(2).await;
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
    assert_eq!(registry_files(dir.path()), 2);

    // moved out of the glob while the agent is down
    let parked = dir.path().join("managed01.log.bak");
    fs::rename(&managed, &parked).unwrap();
    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), ""), sink.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
    assert!(sink.messages().is_empty());
    assert_eq!(registry_files(dir.path()), 2);

    // back again: only the new record ships
    fs::rename(&parked, &managed).unwrap();
    append(&managed, RECORD_C);
    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), ""), sink.clone()).await;
    sink.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.messages(), vec![RECORD_C.trim_end().to_string()]);
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_at_end_skips_backlog() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    let log = dir.path().join("logs").join("managed01.log");
    append(&log, RECORD_A);

    let sink = CollectingSink::new(Behavior::Accept);
    let running = Running::start(config(dir.path(), "start_at: end"), sink.clone()).await;
    append(&log, RECORD_B);

    let messages = sink.wait_for(1).await;
    assert_eq!(messages, vec![RECORD_B.trim_end().to_string()]);
    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_record_flushed_on_shutdown() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    let log = dir.path().join("logs").join("AdminServer.log");

    let sink = CollectingSink::new(Behavior::Accept);
    // idle flush is far away, only shutdown can flush the record
    let mut cfg = config(dir.path(), "");
    cfg.multiline.timeout = Duration::from_secs(600);
    let running = Running::start(cfg, sink.clone()).await;
    append(&log, RECORD_B);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sink.messages().is_empty());

    assert_eq!(running.stop().await, ShutdownState::StoppedClean);
    assert_eq!(sink.messages(), vec![RECORD_B.trim_end().to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_failure_stops_agent() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    append(&dir.path().join("logs").join("AdminServer.log"), RECORD_B);

    let extra = "retry:\n  initial_backoff: 10ms\n  max_backoff: 20ms\n  max_retries: 2\n";
    let agent = Agent::new(config(dir.path(), extra))
        .with_sink(Box::new(CollectingSink::new(Behavior::Reject)));
    let res = tokio::time::timeout(Duration::from_secs(10), agent.run(CancellationToken::new()))
        .await
        .expect("agent did not stop");
    assert_eq!(assert_ok!(res), ShutdownState::StoppedFailed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_timeout() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("logs")).unwrap();
    append(&dir.path().join("logs").join("AdminServer.log"), RECORD_B);

    let extra = "shutdown:\n  drain_timeout: 200ms\n";
    let sink = CollectingSink::new(Behavior::Hang);
    let running = Running::start(config(dir.path(), extra), sink).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = running.stop().await;
    assert_eq!(state, ShutdownState::StoppedTimeout);
    assert_eq!(state.exit_code(), 2);
}

#[tokio::test]
async fn test_corrupt_registry_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("data")).unwrap();
    fs::write(dir.path().join("data").join("registry.json"), "{not json").unwrap();

    let agent = Agent::new(config(dir.path(), ""))
        .with_sink(Box::new(CollectingSink::new(Behavior::Accept)));
    assert_err!(agent.run(CancellationToken::new()).await);
}
