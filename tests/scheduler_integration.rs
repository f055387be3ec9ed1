//! End-to-end scheduler tests against an in-memory database, a stub source
//! backend, and a local HTTP fixture serving image bytes.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use claw::config::{Config, ConfigHandle, ReloadBroadcaster};
use claw::database::models::{DeviceDbModel, JobDbModel, JobStatus, NsfwMode, SourceDbModel};
use claw::database::repositories::{
    DeviceRepository, ImageRepository, JobRepository, SourceRepository, SqlxDeviceRepository,
    SqlxImageRepository, SqlxJobRepository, SqlxSourceRepository,
};
use claw::database::{self, DbPool};
use claw::downloader::Downloader;
use claw::scheduler::Scheduler;
use claw::source::{ImageMeta, Request, Response, SourceBackend, SourceRegistry};
use claw::Result;

const STUB_BACKEND: &str = "test.stub.v1";

/// Backend that returns a canned image list after an optional delay, and
/// records how many runs are in flight at once.
struct StubBackend {
    images: Vec<ImageMeta>,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
    runs: AtomicUsize,
    last_countback: AtomicI64,
}

impl StubBackend {
    fn new(images: Vec<ImageMeta>) -> Self {
        Self::with_delay(images, Duration::ZERO)
    }

    fn with_delay(images: Vec<ImageMeta>, delay: Duration) -> Self {
        Self {
            images,
            delay,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            last_countback: AtomicI64::new(i64::MIN),
        }
    }
}

#[async_trait]
impl SourceBackend for StubBackend {
    fn name(&self) -> &'static str {
        STUB_BACKEND
    }
    fn display_name(&self) -> &'static str {
        "Stub"
    }
    fn author(&self) -> &'static str {
        ""
    }
    fn author_url(&self) -> &'static str {
        ""
    }
    fn description(&self) -> &'static str {
        ""
    }
    fn require_parameter(&self) -> bool {
        false
    }
    fn parameter_help(&self) -> &'static str {
        ""
    }
    fn parameter_placeholder(&self) -> &'static str {
        ""
    }
    fn default_countback(&self) -> i64 {
        25
    }
    async fn validate_transform_parameter(&self, parameter: &str) -> Result<String> {
        Ok(parameter.to_string())
    }

    async fn run(&self, request: Request) -> Result<Response> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.last_countback.store(request.countback, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Response {
            images: self.images.clone(),
        })
    }
}

/// Minimal HTTP server: answers every request with 200 and the given body.
async fn spawn_image_server(body: Vec<u8>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

struct Harness {
    pool: DbPool,
    config: ConfigHandle,
    scheduler: Arc<Scheduler>,
    jobs: Arc<SqlxJobRepository>,
    sources: Arc<SqlxSourceRepository>,
    devices: Arc<SqlxDeviceRepository>,
    images: Arc<SqlxImageRepository>,
    source_id: i64,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(backend: Arc<dyn SourceBackend>) -> Self {
        let pool = database::init_pool_with_size("sqlite::memory:", 1)
            .await
            .unwrap();
        database::run_migrations(&pool).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.scheduler.poll_interval_ms = 25;
        config.scheduler.exit_timeout_ms = 500;
        config.download.base_dir = dir.path().join("base");
        config.download.tmp_dir = dir.path().join("tmp");
        config.download.sanity_check.min_image_filesize = 16;

        let config = ConfigHandle::new(config);
        let reload = ReloadBroadcaster::new();
        let registry = Arc::new(SourceRegistry::new().register(backend));

        let jobs = Arc::new(SqlxJobRepository::new(pool.clone()));
        let sources = Arc::new(SqlxSourceRepository::new(pool.clone()));
        let devices = Arc::new(SqlxDeviceRepository::new(pool.clone()));
        let images = Arc::new(SqlxImageRepository::new(pool.clone()));

        let downloader = Arc::new(Downloader::new(
            reqwest::Client::new(),
            config.clone(),
            images.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            reload,
            jobs.clone(),
            sources.clone(),
            devices.clone(),
            registry,
            downloader,
        ));

        let source = sources
            .create_source(&SourceDbModel::new(STUB_BACKEND, "anything"))
            .await
            .unwrap();

        Self {
            pool,
            config,
            scheduler,
            jobs,
            sources,
            devices,
            images,
            source_id: source.id,
            _dir: dir,
        }
    }

    /// Spawn the scheduler loop; returns the token that stops it.
    fn start(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let scheduler = self.scheduler.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            scheduler.start(run_token).await;
        });
        (token, handle)
    }

    async fn create_job(&self) -> JobDbModel {
        self.jobs
            .create_job(&JobDbModel::new(self.source_id))
            .await
            .unwrap()
    }

    async fn wait_for_status(&self, job_id: i64, status: JobStatus) -> JobDbModel {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.jobs.get_job(job_id).await.unwrap();
            if job.get_status() == Some(status) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job {job_id} to become {status}, currently {}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn image_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn image_device_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM image_devices")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

fn test_image(url: String) -> ImageMeta {
    ImageMeta {
        download_url: url,
        width: 1920,
        height: 1080,
        filesize: 2_000_000,
        author: "someone".into(),
        is_nsfw: false,
        ..ImageMeta::default()
    }
}

fn matching_device() -> DeviceDbModel {
    DeviceDbModel::new("desk", 1920, 1080)
        .with_aspect_ratio_difference(0.01)
        .with_nsfw_mode(NsfwMode::Accept)
}

#[tokio::test]
async fn empty_response_completes_job() {
    let backend = Arc::new(StubBackend::new(Vec::new()));
    let harness = Harness::new(backend.clone()).await;
    let (token, run) = harness.start();

    let job = harness.create_job().await;
    let done = harness.wait_for_status(job.id, JobStatus::Completed).await;

    assert!(done.run_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(done.error.is_none());
    assert_eq!(harness.image_count().await, 0);
    // The engine hands the raw countback through; substituting a default is
    // the backend's job.
    assert_eq!(backend.last_countback.load(Ordering::SeqCst), 0);

    token.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn one_image_one_matching_device() {
    let body = vec![0xAB_u8; 2048];
    let base_url = spawn_image_server(body.clone()).await;
    let url = format!("{base_url}/y.jpg");

    let harness = Harness::new(Arc::new(StubBackend::new(vec![test_image(url.clone())]))).await;
    let device = harness
        .devices
        .create_device(&matching_device())
        .await
        .unwrap();

    let (token, run) = harness.start();
    let job = harness.create_job().await;
    harness.wait_for_status(job.id, JobStatus::Completed).await;
    token.cancel();
    run.await.unwrap();

    let image = harness
        .images
        .get_by_download_url(&url)
        .await
        .unwrap()
        .expect("image row must exist");
    assert_eq!(harness.image_count().await, 1);
    assert_eq!(harness.images.count_devices(image.id).await.unwrap(), 1);

    let paths = harness.images.list_paths(image.id).await.unwrap();
    assert_eq!(paths.len(), 2, "primary path plus one device path");
    assert!(paths.iter().any(|p| p.path == image.image_path));

    for path in &paths {
        let on_disk = std::fs::read(&path.path).expect("file must exist on disk");
        assert_eq!(on_disk, body);
    }

    let device_path = paths
        .iter()
        .find(|p| p.path != image.image_path)
        .expect("device path row must exist");
    assert!(device_path.path.contains(&device.slug));
    assert!(device_path.path.contains(&format!("{STUB_BACKEND}_")));

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&device_path.path).unwrap();
        assert_eq!(meta.nlink(), 2, "device copy should be a hardlink");
    }
}

#[tokio::test]
async fn rerunning_job_is_idempotent() {
    let base_url = spawn_image_server(vec![0xCD_u8; 2048]).await;
    let url = format!("{base_url}/y.jpg");

    let harness = Harness::new(Arc::new(StubBackend::new(vec![test_image(url.clone())]))).await;
    harness
        .devices
        .create_device(&matching_device())
        .await
        .unwrap();

    let (token, run) = harness.start();
    let first = harness.create_job().await;
    harness
        .wait_for_status(first.id, JobStatus::Completed)
        .await;

    let image = harness
        .images
        .get_by_download_url(&url)
        .await
        .unwrap()
        .unwrap();
    let primary_modified = std::fs::metadata(&image.image_path).unwrap().modified().unwrap();

    let second = harness.create_job().await;
    harness
        .wait_for_status(second.id, JobStatus::Completed)
        .await;
    token.cancel();
    run.await.unwrap();

    assert_eq!(harness.image_count().await, 1);
    assert_eq!(harness.image_device_count().await, 1);
    assert_eq!(harness.images.list_paths(image.id).await.unwrap().len(), 2);
    // The primary file was reused, not re-downloaded.
    assert_eq!(
        std::fs::metadata(&image.image_path).unwrap().modified().unwrap(),
        primary_modified
    );
}

#[tokio::test]
async fn deleted_file_is_restored_on_rerun() {
    let body = vec![0xEF_u8; 2048];
    let base_url = spawn_image_server(body.clone()).await;
    let url = format!("{base_url}/y.jpg");

    let harness = Harness::new(Arc::new(StubBackend::new(vec![test_image(url.clone())]))).await;
    harness
        .devices
        .create_device(&matching_device())
        .await
        .unwrap();

    let (token, run) = harness.start();
    let first = harness.create_job().await;
    harness
        .wait_for_status(first.id, JobStatus::Completed)
        .await;

    let image = harness
        .images
        .get_by_download_url(&url)
        .await
        .unwrap()
        .unwrap();
    std::fs::remove_file(&image.image_path).unwrap();

    let second = harness.create_job().await;
    harness
        .wait_for_status(second.id, JobStatus::Completed)
        .await;
    token.cancel();
    run.await.unwrap();

    assert_eq!(std::fs::read(&image.image_path).unwrap(), body);
    assert_eq!(harness.image_count().await, 1);
}

#[tokio::test]
async fn aspect_ratio_mismatch_assigns_nothing() {
    let base_url = spawn_image_server(vec![0u8; 2048]).await;
    // Ratio 4.0 against a 16:9 device with 0.1 tolerance.
    let image = ImageMeta {
        width: 4000,
        height: 1000,
        ..test_image(format!("{base_url}/wide.jpg"))
    };

    let harness = Harness::new(Arc::new(StubBackend::new(vec![image]))).await;
    harness
        .devices
        .create_device(&DeviceDbModel::new("desk", 1920, 1080).with_aspect_ratio_difference(0.1))
        .await
        .unwrap();

    let (token, run) = harness.start();
    let job = harness.create_job().await;
    harness.wait_for_status(job.id, JobStatus::Completed).await;
    token.cancel();
    run.await.unwrap();

    assert_eq!(harness.image_count().await, 0);
    assert_eq!(harness.image_device_count().await, 0);
}

#[tokio::test]
async fn nsfw_image_skips_blocking_device() {
    let base_url = spawn_image_server(vec![0u8; 2048]).await;
    let image = ImageMeta {
        is_nsfw: true,
        ..test_image(format!("{base_url}/nsfw.jpg"))
    };

    let harness = Harness::new(Arc::new(StubBackend::new(vec![image]))).await;
    harness
        .devices
        .create_device(&matching_device().with_nsfw_mode(NsfwMode::Block))
        .await
        .unwrap();

    let (token, run) = harness.start();
    let job = harness.create_job().await;
    harness.wait_for_status(job.id, JobStatus::Completed).await;
    token.cancel();
    run.await.unwrap();

    assert_eq!(harness.image_count().await, 0);
    assert_eq!(harness.image_device_count().await, 0);
}

#[tokio::test]
async fn backend_error_fails_job_with_message() {
    struct FailingBackend;

    #[async_trait]
    impl SourceBackend for FailingBackend {
        fn name(&self) -> &'static str {
            STUB_BACKEND
        }
        fn display_name(&self) -> &'static str {
            "Failing"
        }
        fn author(&self) -> &'static str {
            ""
        }
        fn author_url(&self) -> &'static str {
            ""
        }
        fn description(&self) -> &'static str {
            ""
        }
        fn require_parameter(&self) -> bool {
            false
        }
        fn parameter_help(&self) -> &'static str {
            ""
        }
        fn parameter_placeholder(&self) -> &'static str {
            ""
        }
        fn default_countback(&self) -> i64 {
            25
        }
        async fn validate_transform_parameter(&self, parameter: &str) -> Result<String> {
            Ok(parameter.to_string())
        }
        async fn run(&self, _request: Request) -> Result<Response> {
            Err(claw::Error::Download("listing fetch exploded".into()))
        }
    }

    let harness = Harness::new(Arc::new(FailingBackend)).await;
    let (token, run) = harness.start();

    let job = harness.create_job().await;
    let failed = harness.wait_for_status(job.id, JobStatus::Failed).await;
    token.cancel();
    run.await.unwrap();

    assert!(failed.finished_at.is_some());
    assert!(failed
        .error
        .as_deref()
        .unwrap()
        .contains("listing fetch exploded"));
}

#[tokio::test]
async fn missing_backend_fails_job() {
    let harness = Harness::new(Arc::new(StubBackend::new(Vec::new()))).await;
    let orphan = harness
        .sources
        .create_source(&SourceDbModel::new("test.gone.v9", "x"))
        .await
        .unwrap();
    let job = harness
        .jobs
        .create_job(&JobDbModel::new(orphan.id))
        .await
        .unwrap();

    let (token, run) = harness.start();
    let failed = harness.wait_for_status(job.id, JobStatus::Failed).await;
    token.cancel();
    run.await.unwrap();

    assert!(failed.error.as_deref().unwrap().contains("test.gone.v9"));
}

#[tokio::test]
async fn shutdown_mid_job_leaves_it_running() {
    let backend = Arc::new(StubBackend::with_delay(
        Vec::new(),
        Duration::from_secs(60),
    ));
    let harness = Harness::new(backend).await;
    let (token, run) = harness.start();

    let job = harness.create_job().await;
    harness.wait_for_status(job.id, JobStatus::Running).await;

    token.cancel();
    run.await.unwrap();

    let after = harness.jobs.get_job(job.id).await.unwrap();
    assert_eq!(after.get_status(), Some(JobStatus::Running));
    assert!(after.finished_at.is_none());
    assert!(after.error.is_none());
}

#[tokio::test]
async fn single_worker_executes_jobs_serially() {
    let backend = Arc::new(StubBackend::with_delay(
        Vec::new(),
        Duration::from_millis(50),
    ));
    let harness = Harness::new(backend.clone()).await;
    {
        let mut config = harness.config.get();
        config.scheduler.max_workers = 1;
        harness.config.replace(config);
    }

    let (token, run) = harness.start();
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(harness.create_job().await.id);
    }
    for id in &ids {
        harness.wait_for_status(*id, JobStatus::Completed).await;
    }
    token.cancel();
    run.await.unwrap();

    assert_eq!(backend.runs.load(Ordering::SeqCst), 4);
    assert_eq!(
        backend.max_running.load(Ordering::SeqCst),
        1,
        "max_workers=1 must serialize job execution"
    );
}
