//! Integration tests for the introspection lifecycle
//!
//! These run the whole stack against stand-ins: a fake QMP monitor on a Unix
//! socket, shell scripts for the export server and the external tools, and a
//! loopback listener that plays the export once the server script has started.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

use introvisor::api::{ActivateRequest, ApiError, IntrospectionApi};
use introvisor::compute::{Instance, StaticInstanceRegistry};
use introvisor::config::{
    CrawlConfig, ExportConfig, HypervisorConfig, IntrospectionConfig, PortConfig, ProbeConfig,
};
use introvisor::context::RequestContext;
use introvisor::driver::{IntrospectionCapability, IntrospectionDriver};
use introvisor::error::IntrospectionError;
use introvisor::hypervisor::QemuDriver;
use introvisor::session::SessionManager;
use introvisor::store::{EntityRepository, MemoryStore};

const DOMAIN: &str = "instance-00000001";

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A loopback port nothing is listening on
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Fake QMP monitor recording every command after capability negotiation
fn fake_monitor(dir: &Path) -> Arc<Mutex<Vec<String>>> {
    let listener = UnixListener::bind(dir.join(format!("{}.monitor", DOMAIN))).unwrap();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&commands);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let (read_half, mut writer) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let _ = writer
                    .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                    .await;
                let mut line = String::new();
                while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    let command = line.trim().to_string();
                    if command != r#"{"execute":"qmp_capabilities"}"# {
                        recorded.lock().unwrap().push(command);
                    }
                    let _ = writer.write_all(b"{\"return\": {}}\n").await;
                    line.clear();
                }
            });
        }
    });
    commands
}

/// Accept connections on `port` once the export script has written `marker`
fn serve_export_when_started(marker: PathBuf, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    })
}

/// Stand-in behaviour for one harness
struct Setup<'a> {
    crawler: &'a str,
    inferencer_exit: i32,
    /// Start listening on the export port once the export script runs
    serve_export: bool,
    readiness_attempts: u32,
}

impl Default for Setup<'_> {
    fn default() -> Self {
        Self {
            crawler: "touch \"$2\"",
            inferencer_exit: 0,
            serve_export: true,
            readiness_attempts: 250,
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    port: u16,
    monitor: Arc<Mutex<Vec<String>>>,
    export: JoinHandle<()>,
    sessions: Arc<SessionManager>,
    api: IntrospectionApi,
}

impl Harness {
    fn new(crawler: &str) -> Self {
        Self::with(Setup {
            crawler,
            ..Default::default()
        })
    }

    fn with(setup: Setup<'_>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        let log = path.join("calls.log");
        let port = free_port();

        let config = IntrospectionConfig {
            ports: PortConfig {
                low: port,
                high: port,
                max_attempts: 4,
                bind_host: "127.0.0.1".to_string(),
            },
            probe: ProbeConfig {
                poll_interval_ms: 20,
                settle_delay_ms: 10,
                max_attempts: setup.readiness_attempts,
            },
            export: ExportConfig {
                server_bin: script(
                    path,
                    "export-server",
                    &format!(
                        "echo export \"$@\" >> {log}\necho $$ > {pid}\nexec sleep 30",
                        pid = path.join("export.pid").display(),
                        log = log.display()
                    ),
                ),
                queue_db_base: 4,
                queue_db_count: 2,
                queue_reset: vec![
                    script(path, "queue-reset", &format!("echo reset \"$@\" >> {}", log.display()))
                        .display()
                        .to_string(),
                    "{db}".to_string(),
                ],
                stop_grace_ms: 500,
            },
            crawl: CrawlConfig {
                crawler_bin: script(path, "crawler", setup.crawler),
                inferencer_bin: script(
                    path,
                    "inferencer",
                    &format!("echo infer \"$@\" >> {}\nexit {}", log.display(), setup.inferencer_exit),
                ),
                nbd_client_bin: script(path, "nbd-client", &format!("echo nbd \"$@\" >> {}", log.display())),
                nbd_devices: vec![path.join("nbd0")],
                artifact_dir: path.join("artifacts"),
            },
            hypervisor: HypervisorConfig {
                monitor_dir: path.to_path_buf(),
                connect_timeout_ms: 2000,
            },
            instances: BTreeMap::from([("vm-1".to_string(), DOMAIN.to_string())]),
            ..Default::default()
        };

        let monitor = fake_monitor(path);
        let export = if setup.serve_export {
            serve_export_when_started(path.join("export.pid"), port)
        } else {
            tokio::spawn(async {})
        };

        let repository = EntityRepository::new(Arc::new(MemoryStore::new()));
        let driver = Arc::new(QemuDriver::from_config(&config.hypervisor));
        let sessions = Arc::new(SessionManager::new(&config, driver, repository.clone()));
        let capability = IntrospectionDriver::detect(Arc::clone(&sessions))
            .map(|d| Arc::new(d) as Arc<dyn IntrospectionCapability>);
        let api = IntrospectionApi::new(
            Arc::new(StaticInstanceRegistry::new(config.instances.clone())),
            repository,
            capability,
        );

        Self {
            dir,
            port,
            monitor,
            export,
            sessions,
            api,
        }
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn monitor_commands(&self) -> Vec<String> {
        self.monitor.lock().unwrap().clone()
    }

    fn export_pid(&self) -> i32 {
        self.read_pid("export.pid")
    }

    fn read_pid(&self, name: &str) -> i32 {
        std::fs::read_to_string(self.dir.path().join(name))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    fn persisted(&self) -> usize {
        self.sessions.repository().list_all().unwrap().len()
    }

    fn instance(&self) -> Instance {
        Instance {
            uuid: "vm-1".to_string(),
            domain_name: DOMAIN.to_string(),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.export.abort();
    }
}

fn request(drive: &str, target: &str) -> ActivateRequest {
    ActivateRequest {
        drive_id: Some(drive.to_string()),
        target: Some(target.to_string()),
    }
}

fn process_gone(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err()
}

/// Dead or a zombie awaiting the reaper
fn process_exited(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

const BLOCK_JOB_CANCEL: &str = r#"{"execute":"block-job-cancel","arguments":{"device":"vda"}}"#;

/// Activate, read back, deactivate through the boundary API
#[tokio::test]
async fn test_activate_get_deactivate() {
    let h = Harness::new("touch \"$2\"");
    let ctx = RequestContext::new();

    let created = h.api.activate(&ctx, "vm-1", request("vda", "malware-scan")).await.unwrap();
    assert_eq!(created.introspected_entity.introspected_entity_id, Some(1));
    assert_eq!(created.introspected_entity.drive_id, "vda");
    assert_eq!(h.api.get(&ctx, "vm-1", 1).await.unwrap(), created);
    let live = h.sessions.sessions().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].entity_id, 1);
    assert_eq!(live[0].port, Some(h.port));
    assert_eq!(live[0].queue_index, Some(4));

    assert_eq!(
        h.monitor_commands(),
        vec![format!(
            r#"{{"execute":"drive-backup","arguments":{{"device":"vda","mode":"existing","format":"raw","target":"nbd://127.0.0.1:{}","sync":"stream"}}}}"#,
            h.port
        )]
    );

    let device = h.dir.path().join("nbd0");
    let artifact = h.dir.path().join("artifacts").join(format!("vm-1-{}.bson", h.port));
    assert_eq!(
        h.calls(),
        vec![
            "reset 4".to_string(),
            format!("export --host 127.0.0.1 --port {} --queue-db 4 --name vda", h.port),
            format!("nbd 127.0.0.1 {} {} -readonly", h.port, device.display()),
            format!("nbd -d {}", device.display()),
            format!("infer {} vm-1 4", artifact.display()),
        ]
    );

    let pid = h.export_pid();
    assert!(!process_gone(pid));

    let accepted = h.api.deactivate(&ctx, "vm-1", 1).await.unwrap();
    assert_eq!(accepted.status_code(), 202);
    assert!(matches!(h.api.get(&ctx, "vm-1", 1).await, Err(ApiError::NotFound(_))));
    assert_eq!(h.sessions.active_count().await, 0);
    assert!(process_gone(pid));
    assert_eq!(h.monitor_commands().last().unwrap(), BLOCK_JOB_CANCEL);
}

#[tokio::test]
async fn test_unknown_instance_starts_nothing() {
    let h = Harness::new("touch \"$2\"");

    let err = h
        .api
        .activate(&RequestContext::new(), "vm-404", request("vda", "malware-scan"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 404);
    assert!(h.calls().is_empty());
    assert!(h.monitor_commands().is_empty());
}

#[tokio::test]
async fn test_second_activation_of_same_triple_conflicts() {
    let h = Harness::new("touch \"$2\"");
    let ctx = RequestContext::new();
    h.sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap();
    let calls_before = h.calls();

    let err = h
        .sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();

    assert!(matches!(err, IntrospectionError::Conflict { .. }));
    assert_eq!(h.calls(), calls_before);
    assert_eq!(h.monitor_commands().len(), 1);

    h.sessions.shutdown().await;
}

#[tokio::test]
async fn test_crawl_failure_unwinds() {
    let h = Harness::new("echo 'bad superblock' >&2; exit 3");
    let ctx = RequestContext::new();

    let err = h
        .sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();

    match err {
        IntrospectionError::ExternalToolFailure {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr.contains("bad superblock"));
        }
        other => panic!("expected ExternalToolFailure, got {:?}", other),
    }

    // Mirror cancelled, export stopped, device detached, nothing persisted
    assert_eq!(h.monitor_commands().last().unwrap(), BLOCK_JOB_CANCEL);
    assert!(process_gone(h.export_pid()));
    assert!(h.calls().iter().any(|c| c.starts_with("nbd -d")));
    assert!(!h.calls().iter().any(|c| c.starts_with("infer")));
    assert!(h.sessions.repository().list_all().unwrap().is_empty());
    assert_eq!(h.sessions.active_count().await, 0);
    assert_eq!(h.sessions.pending_count(), 0);

    // The failed triple can be retried
    let err = h
        .sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();
    assert!(!matches!(err, IntrospectionError::Conflict { .. }));
}

#[tokio::test]
async fn test_teardown_stops_live_sessions() {
    let h = Harness::new("touch \"$2\"");
    let ctx = RequestContext::new();
    h.sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap();
    let pid = h.export_pid();

    h.sessions.teardown_instance(&ctx, &h.instance()).await.unwrap();

    assert!(process_gone(pid));
    assert_eq!(h.sessions.active_count().await, 0);
    assert!(h.sessions.repository().list_by_instance("vm-1", false).unwrap().is_empty());
}

#[tokio::test]
async fn test_export_never_listening_times_out_and_unwinds() {
    let h = Harness::with(Setup {
        serve_export: false,
        readiness_attempts: 10,
        ..Default::default()
    });
    let ctx = RequestContext::new();

    let err = h
        .sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();
    assert!(matches!(err, IntrospectionError::Timeout { attempts: 10, .. }));

    // The mirror never started, so there is nothing to cancel
    assert!(h.monitor_commands().is_empty());
    assert!(process_gone(h.export_pid()));
    assert!(!h.calls().iter().any(|c| c.starts_with("nbd")));
    assert_eq!(h.persisted(), 0);
    assert_eq!(h.sessions.pending_count(), 0);
    assert_eq!(h.sessions.active_count().await, 0);

    // A retry gets the same queue index back
    let err = h
        .sessions
        .activate(&ctx, &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();
    assert!(matches!(err, IntrospectionError::Timeout { .. }));
    let export = format!("export --host 127.0.0.1 --port {} --queue-db 4 --name vda", h.port);
    assert_eq!(
        h.calls(),
        vec!["reset 4".to_string(), export.clone(), "reset 4".to_string(), export]
    );
    assert!(process_gone(h.export_pid()));
}

#[tokio::test]
async fn test_inference_failure_unwinds() {
    let h = Harness::with(Setup {
        inferencer_exit: 4,
        ..Default::default()
    });

    let err = h
        .sessions
        .activate(&RequestContext::new(), &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntrospectionError::ExternalToolFailure { exit_code: Some(4), .. }
    ));

    assert_eq!(h.monitor_commands().last().unwrap(), BLOCK_JOB_CANCEL);
    assert!(process_gone(h.export_pid()));
    let calls = h.calls();
    assert!(calls.last().unwrap().starts_with("infer"));
    assert!(calls.iter().any(|c| c.starts_with("nbd -d")));
    assert_eq!(h.persisted(), 0);
    assert_eq!(h.sessions.pending_count(), 0);
    assert_eq!(h.sessions.active_count().await, 0);
}

#[tokio::test]
async fn test_held_port_is_exhausted_before_anything_starts() {
    let h = Harness::new("touch \"$2\"");
    let _held = std::net::TcpListener::bind(("127.0.0.1", h.port)).unwrap();

    let err = h
        .sessions
        .activate(&RequestContext::new(), &h.instance(), "vda", "malware-scan")
        .await
        .unwrap_err();
    assert!(matches!(err, IntrospectionError::PortExhausted { attempts: 4, .. }));

    assert!(h.calls().is_empty());
    assert!(h.monitor_commands().is_empty());
    assert!(!h.dir.path().join("export.pid").exists());
    assert_eq!(h.persisted(), 0);
    assert_eq!(h.sessions.pending_count(), 0);
}

#[tokio::test]
async fn test_teardown_interrupts_running_crawl() {
    // $2 is <dir>/artifacts/<snapshot>
    let h = Harness::new("echo $$ > \"$(dirname \"$2\")/../crawler.pid\"\nexec sleep 30");
    let ctx = RequestContext::new();

    let sessions = Arc::clone(&h.sessions);
    let instance = h.instance();
    let activation = tokio::spawn(async move {
        sessions
            .activate(&RequestContext::new(), &instance, "vda", "malware-scan")
            .await
    });

    let crawler_pid = h.dir.path().join("crawler.pid");
    wait_until(|| crawler_pid.exists()).await;
    let export_pid = h.export_pid();
    let pid = h.read_pid("crawler.pid");

    let started = Instant::now();
    h.sessions.teardown_instance(&ctx, &h.instance()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), activation)
        .await
        .expect("activation did not unwind")
        .unwrap();
    assert!(matches!(result, Err(IntrospectionError::Cancelled(_))));
    assert!(started.elapsed() < Duration::from_secs(5));

    wait_until(|| process_exited(pid)).await;
    assert!(process_gone(export_pid));
    assert_eq!(h.monitor_commands().last().unwrap(), BLOCK_JOB_CANCEL);
    let calls = h.calls();
    assert!(calls.last().unwrap().starts_with("nbd -d"));
    assert!(!calls.iter().any(|c| c.starts_with("infer")));
    assert_eq!(h.persisted(), 0);
    assert_eq!(h.sessions.pending_count(), 0);
    assert_eq!(h.sessions.active_count().await, 0);
}

/// Needs a hypervisor with a running domain and the nbd kernel module
#[tokio::test]
#[ignore = "requires QEMU, nbd-client and the export tooling"]
async fn test_real_hypervisor_activation() {
    let path = std::env::var("INTROVISOR_CONFIG").unwrap_or_else(|_| "introvisor.toml".into());
    let config = IntrospectionConfig::from_file(path).unwrap();
    let repository = EntityRepository::new(Arc::new(MemoryStore::new()));
    let driver = Arc::new(QemuDriver::from_config(&config.hypervisor));
    let sessions = SessionManager::new(&config, driver, repository);
    let (uuid, domain) = config.instances.iter().next().unwrap();
    let instance = Instance {
        uuid: uuid.clone(),
        domain_name: domain.clone(),
    };

    let ctx = RequestContext::new();
    let entity = sessions.activate(&ctx, &instance, "vda", "file-index").await.unwrap();
    sessions.deactivate(&ctx, &instance, entity.id.unwrap()).await.unwrap();
}
