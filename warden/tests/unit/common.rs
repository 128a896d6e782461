//! Shared test helpers

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;

use warden::control::events::EventJournal;
use warden::control::surface::{ControlSurface, SurfaceOptions};
use warden::deploy::fetcher::ArtifactFetcher;
use warden::deploy::identity::IdentityRecord;
use warden::deploy::supervisor::{OutputFiles, ProcessSupervisor, SupervisorOptions};
use warden::errors::FetchError;
use warden::filesys::dir::Dir;
use warden::health::prober::{HealthProber, ProberOptions};
use warden::models::artifact::{DeploymentArtifact, FetchTarget};
use warden::utils::sha256_hash;

/// Bind a listener on an ephemeral local port
pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Serve a stub router in the background
pub fn spawn_stub(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

pub async fn serve_stub(router: Router) -> SocketAddr {
    let (listener, addr) = bind().await;
    spawn_stub(listener, router);
    addr
}

/// Supervisor running `sleep 30` with short timeouts
pub fn sleep_supervisor(dir: &Dir) -> ProcessSupervisor {
    ProcessSupervisor::new(
        SupervisorOptions {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            stop_timeout: Duration::from_secs(2),
            startup_grace: Duration::from_millis(200),
            ..Default::default()
        },
        IdentityRecord::new(dir.file("identity.json")),
        OutputFiles {
            stdout: dir.file("service.out.log"),
            stderr: dir.file("service.err.log"),
        },
    )
}

/// Supervisor that only keeps running when the artifact file is not empty
pub fn checking_supervisor(dir: &Dir) -> ProcessSupervisor {
    ProcessSupervisor::new(
        SupervisorOptions {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "test -s '{artifact}' || exit 1; exec sleep 30".to_string(),
            ],
            working_dir: None,
            env: BTreeMap::new(),
            stop_timeout: Duration::from_secs(2),
            startup_grace: Duration::from_millis(300),
            ..Default::default()
        },
        IdentityRecord::new(dir.file("identity.json")),
        OutputFiles {
            stdout: dir.file("service.out.log"),
            stderr: dir.file("service.err.log"),
        },
    )
}

/// A small file standing in for a built artifact
pub async fn fake_artifact(artifacts_dir: &Dir, version: &str) -> DeploymentArtifact {
    let file = artifacts_dir.subdir(version).file("app.jar");
    file.write_atomic(b"not really a jar").await.unwrap();
    DeploymentArtifact {
        version: version.to_string(),
        source: "scripted".to_string(),
        path: file.path().to_path_buf(),
        sha256: sha256_hash(b"not really a jar"),
        fetched_at: Utc::now(),
    }
}

pub fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status();
}

/// Fetcher whose answers are set by the test
pub struct ScriptedFetcher {
    artifacts_dir: Dir,
    version: Mutex<String>,
    error: Mutex<Option<FetchError>>,
    delay: Mutex<Duration>,
    broken: Mutex<bool>,
    pub fetches: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(artifacts_dir: Dir) -> Self {
        Self {
            artifacts_dir,
            version: Mutex::new("v1".to_string()),
            error: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            broken: Mutex::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    pub fn fail_with(&self, error: Option<FetchError>) {
        *self.error.lock().unwrap() = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Produce empty artifacts, which `checking_supervisor` refuses to run
    pub fn set_broken(&self, broken: bool) {
        *self.broken.lock().unwrap() = broken;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for ScriptedFetcher {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn latest_version(&self) -> Result<String, FetchError> {
        if let Some(e) = self.error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.version.lock().unwrap().clone())
    }

    async fn fetch(&self, _target: &FetchTarget) -> Result<DeploymentArtifact, FetchError> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let error = self.error.lock().unwrap().clone();
        if let Some(e) = error {
            return Err(e);
        }
        let version = self.version.lock().unwrap().clone();
        let mut artifact = fake_artifact(&self.artifacts_dir, &version).await;
        if *self.broken.lock().unwrap() {
            tokio::fs::write(&artifact.path, b"").await.unwrap();
            artifact.sha256 = sha256_hash(b"");
        }
        Ok(artifact)
    }
}

/// A control surface over `sleep` processes in a scratch directory
pub struct Harness {
    pub dir: Dir,
    pub supervisor: Arc<ProcessSupervisor>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub surface: Arc<ControlSurface>,
}

impl Harness {
    pub async fn new(prefix: &str) -> Self {
        let dir = Dir::create_temp_dir(prefix).await.unwrap();
        Self::in_dir(dir, SurfaceOptions {
            redeploy_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
        })
        .await
    }

    /// Harness with `v1` already recorded as the current artifact
    pub async fn with_artifact(prefix: &str) -> Self {
        let dir = Dir::create_temp_dir(prefix).await.unwrap();
        let artifact = fake_artifact(&dir.subdir("artifacts"), "v1").await;
        dir.file("artifact.json").write_json(&artifact).await.unwrap();
        Self::in_dir(dir, SurfaceOptions {
            redeploy_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
        })
        .await
    }

    pub async fn in_dir(dir: Dir, options: SurfaceOptions) -> Self {
        let supervisor = sleep_supervisor(&dir);
        Self::with_supervisor(dir, supervisor, options).await
    }

    pub async fn with_supervisor(
        dir: Dir,
        supervisor: ProcessSupervisor,
        options: SurfaceOptions,
    ) -> Self {
        let supervisor = Arc::new(supervisor);
        let fetcher = Arc::new(ScriptedFetcher::new(dir.subdir("artifacts")));
        let prober = Arc::new(
            HealthProber::new(
                supervisor.clone(),
                ProberOptions {
                    url: None,
                    timeout: Duration::from_secs(1),
                },
            )
            .unwrap(),
        );
        let surface = Arc::new(
            ControlSurface::new(
                supervisor.clone(),
                fetcher.clone(),
                prober,
                Arc::new(EventJournal::in_memory(100)),
                dir.file("artifact.json"),
                options,
            )
            .await
            .unwrap(),
        );

        Self {
            dir,
            supervisor,
            fetcher,
            surface,
        }
    }

    /// Stop whatever is still running and remove the scratch directory
    pub async fn cleanup(self) {
        if let Ok(Some(identity)) = self.supervisor.identity().await {
            if self.supervisor.stop().await.is_err() {
                kill_pid(identity.pid);
            }
        }
        let _ = self.dir.delete().await;
    }
}
