//! Tests for the container lifecycle.
//!
//! Every test builds a real image under a temporary root and runs its entry
//! script with `/bin/sh`. Grace periods are short so forced kills stay fast.

use flate2::Compression;
use flate2::write::GzEncoder;
use qnxtainer::{ContainerStatus, Engine, EngineConfig, Error, Image};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const GRACE: Duration = Duration::from_secs(1);

async fn engine_with_grace(temp: &TempDir, cmd: &str, grace: Duration) -> (Engine, Arc<Image>) {
    let config = EngineConfig::with_root(temp.path().join("root")).stop_grace_period(grace);
    let engine = Engine::new(config).unwrap();

    let context = temp.path().join("ctx");
    fs::create_dir_all(&context).unwrap();
    // a JSON string is a valid YAML double-quoted scalar
    let manifest = format!(
        "name: demo\nbuild: \"true\"\ncmd: {}\nenv:\n  FOO: bar\n",
        serde_json::to_string(cmd).unwrap()
    );
    fs::write(context.join("qnxtainer.yml"), manifest).unwrap();

    let built = engine.build_image(&context).await.unwrap();
    let image = engine
        .upload_image(&built.archive, &built.reference.name, Some(&built.reference.tag))
        .unwrap();
    (engine, image)
}

async fn engine_with_image(temp: &TempDir, cmd: &str) -> (Engine, Arc<Image>) {
    engine_with_grace(temp, cmd, GRACE).await
}

/// Uploads an image whose archive holds a single data file and no `run.sh`.
fn upload_bare_image(temp: &TempDir, engine: &Engine) -> Arc<Image> {
    let archive = temp.path().join("bare.tar.gz");
    let file = fs::File::create(&archive).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let data = b"hello";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "image/file.txt", &data[..]).unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    engine.upload_image(&archive, "bare", None).unwrap()
}

fn workspace(engine: &Engine, id: &str) -> PathBuf {
    engine
        .container(id)
        .unwrap()
        .state
        .workspace()
        .map(Path::to_path_buf)
        .unwrap()
}

async fn wait_for_exit(engine: &Engine, id: &str, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(code) = engine.poll_exit(id).unwrap() {
            return Some(code);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

// =============================================================================
// Prepare Tests
// =============================================================================

#[tokio::test]
async fn test_prepare_copies_into_private_workspace() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;

    let id = engine.create_container(&image.id, Some("web")).unwrap();
    let container = engine.container(&id).unwrap();
    let ws = workspace(&engine, &id);

    assert_eq!(container.status(), ContainerStatus::Prepared);
    assert_eq!(container.name.as_deref(), Some("web"));
    assert_eq!(container.limits, None);
    assert_eq!(ws, temp.path().join("root/containers").join(&id));
    assert_eq!(container.entry_script, ws.join("image/run.sh"));
    assert!(container.entry_script.is_file());

    fs::write(ws.join("image/scratch.txt"), "mine").unwrap();
    fs::write(ws.join("image/.env"), "CHANGED=1\n").unwrap();

    assert!(!image.rootfs().join("scratch.txt").exists());
    assert_eq!(fs::read_to_string(image.rootfs().join(".env")).unwrap(), "FOO=bar\n");
}

#[tokio::test]
async fn test_containers_get_distinct_workspaces() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;

    let a = engine.create_container(&image.id, None).unwrap();
    let b = engine.create_container(&image.id, None).unwrap();

    assert_ne!(a, b);
    assert_ne!(workspace(&engine, &a), workspace(&engine, &b));
    assert!(Arc::ptr_eq(&engine.container(&a).unwrap().image, &image));
}

#[tokio::test]
async fn test_prepare_by_alias() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;

    let id = engine.create_container("demo:latest", None).unwrap();
    assert_eq!(engine.container(&id).unwrap().image.id, image.id);
}

#[tokio::test]
async fn test_prepare_missing_image_directory() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;
    fs::remove_dir_all(&image.path).unwrap();

    let result = engine.create_container(&image.id, None);

    assert!(matches!(result, Err(Error::ImageNotFound(_))));
    assert_eq!(engine.registry().container_count(), 0);
    assert_eq!(fs::read_dir(temp.path().join("root/containers")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_prepare_rejects_bad_name() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;

    assert!(engine.create_container(&image.id, Some("../x")).is_err());
    assert_eq!(engine.registry().container_count(), 0);
}

// =============================================================================
// Start Tests
// =============================================================================

#[tokio::test]
async fn test_start_records_pid_and_limits() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "sleep 30").await;
    let id = engine.create_container(&image.id, None).unwrap();

    let started = engine.start_container(&id, 5, 64).unwrap();
    let container = engine.container(&id).unwrap();

    assert_eq!(started, id);
    assert_eq!(container.status(), ContainerStatus::Running);
    assert!(container.state.pid().is_some());
    let limits = container.limits.unwrap();
    assert_eq!((limits.cpu_seconds, limits.memory_megabytes), (5, 64));

    engine.stop_container(&id).await.unwrap();
}

#[tokio::test]
async fn test_double_start_is_noop() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "sleep 30").await;
    let id = engine.create_container(&image.id, None).unwrap();

    engine.start_container(&id, 5, 64).unwrap();
    let pid = engine.container(&id).unwrap().state.pid();
    engine.start_container(&id, 10, 128).unwrap();

    let container = engine.container(&id).unwrap();
    assert_eq!(container.state.pid(), pid, "second start must not respawn");
    assert_eq!(container.limits.unwrap().cpu_seconds, 5);
    assert_eq!(engine.lifecycle().running_count(), 1);

    engine.stop_container(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_start_spawns_once() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "sleep 30").await;
    let id = engine.create_container(&image.id, None).unwrap();
    let handle = tokio::runtime::Handle::current();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let _guard = handle.enter();
                engine.start_container(&id, 5, 64).unwrap();
            });
        }
    });

    assert_eq!(engine.lifecycle().running_count(), 1);
    engine.stop_container(&id).await.unwrap();
}

#[tokio::test]
async fn test_image_without_runner_prepares_but_cannot_start() {
    let temp = TempDir::new().unwrap();
    let (engine, _image) = engine_with_image(&temp, "true").await;
    let bare = upload_bare_image(&temp, &engine);

    let id = engine.create_container(&bare.id, None).unwrap();
    let ws = workspace(&engine, &id);
    assert_eq!(fs::read_to_string(ws.join("image/file.txt")).unwrap(), "hello");
    assert!(!ws.join("image/run.sh").exists());

    let result = engine.start_container(&id, 5, 64);
    assert!(matches!(result, Err(Error::StartFailed { .. })), "got {:?}", result);
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Prepared);
    assert_eq!(engine.lifecycle().running_count(), 0);

    engine.stop_container(&id).await.unwrap();
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
    assert!(!ws.exists());
}

#[tokio::test]
async fn test_failed_start_from_image_discards_container() {
    let temp = TempDir::new().unwrap();
    let (engine, _image) = engine_with_image(&temp, "true").await;
    let bare = upload_bare_image(&temp, &engine);

    let result = engine.start_container_from_image(&bare.id, 5, 64);

    assert!(matches!(result, Err(Error::StartFailed { .. })), "got {:?}", result);
    let state = engine.export_state();
    assert_eq!(state.containers.len(), 1);
    assert_eq!(state.containers[0].status, ContainerStatus::Stopped);
    assert_eq!(fs::read_dir(temp.path().join("root/containers")).unwrap().count(), 0);
    assert_eq!(engine.lifecycle().running_count(), 0);
}

#[tokio::test]
async fn test_invalid_limits_leave_container_prepared() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;
    let id = engine.create_container(&image.id, None).unwrap();

    assert!(matches!(engine.start_container(&id, 0, 64), Err(Error::InvalidLimits(_))));
    assert!(matches!(engine.start_container(&id, 5, 0), Err(Error::InvalidLimits(_))));

    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Prepared);
    assert!(workspace(&engine, &id).is_dir());
}

#[tokio::test]
async fn test_start_from_image_checks_limits_first() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;

    let result = engine.start_container_from_image(&image.id, 0, 64);

    assert!(matches!(result, Err(Error::InvalidLimits(_))));
    assert_eq!(engine.registry().container_count(), 0);
}

#[tokio::test]
async fn test_start_after_stop_is_invalid() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;
    let id = engine.create_container(&image.id, None).unwrap();
    engine.stop_container(&id).await.unwrap();

    let result = engine.start_container(&id, 5, 64);
    assert!(matches!(result, Err(Error::InvalidState { .. })));
}

// =============================================================================
// Process Environment Tests
// =============================================================================

#[tokio::test]
async fn test_env_and_working_directory() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "echo \"$FOO\" > out.txt; pwd > cwd.txt").await;
    let id = engine.create_container(&image.id, None).unwrap();
    let ws = workspace(&engine, &id);

    engine.start_container(&id, 5, 64).unwrap();
    assert_eq!(wait_for_exit(&engine, &id, Duration::from_secs(10)).await, Some(0));

    assert_eq!(fs::read_to_string(ws.join("image/out.txt")).unwrap(), "bar\n");
    let cwd = fs::read_to_string(ws.join("image/cwd.txt")).unwrap();
    assert_eq!(
        Path::new(cwd.trim()).canonicalize().unwrap(),
        ws.join("image").canonicalize().unwrap()
    );

    engine.stop_container(&id).await.unwrap();
}

#[tokio::test]
async fn test_rlimits_applied() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "ulimit -t > limits.txt; ulimit -v >> limits.txt").await;
    let id = engine.create_container(&image.id, None).unwrap();
    let ws = workspace(&engine, &id);

    engine.start_container(&id, 5, 64).unwrap();
    assert_eq!(wait_for_exit(&engine, &id, Duration::from_secs(10)).await, Some(0));

    let limits = fs::read_to_string(ws.join("image/limits.txt")).unwrap();
    let lines: Vec<&str> = limits.lines().collect();
    assert_eq!(lines, vec!["5", "65536"], "cpu seconds and address space in KiB");

    engine.stop_container(&id).await.unwrap();
}

#[tokio::test]
async fn test_exit_code_reported() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "exit 7").await;
    let id = engine.start_container_from_image(&image.id, 5, 64).unwrap();

    assert_eq!(wait_for_exit(&engine, &id, Duration::from_secs(10)).await, Some(7));
    // exit does not change state until stop
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Running);

    engine.stop_container(&id).await.unwrap();
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
}

#[tokio::test]
async fn test_cpu_limit_kills_busy_loop() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "while :; do :; done").await;
    let id = engine.start_container_from_image(&image.id, 1, 64).unwrap();

    let code = wait_for_exit(&engine, &id, Duration::from_secs(15)).await;

    let code = code.expect("busy loop should be killed by RLIMIT_CPU");
    assert!(code > 128, "expected a signal death, got {}", code);

    engine.stop_container(&id).await.unwrap();
}

// =============================================================================
// Stop Tests
// =============================================================================

#[tokio::test]
async fn test_stop_running_container() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_grace(&temp, "sleep 30", Duration::from_secs(10)).await;
    let id = engine.start_container_from_image(&image.id, 5, 64).unwrap();
    let ws = workspace(&engine, &id);

    let started = Instant::now();
    engine.stop_container(&id).await.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "SIGTERM should end the group well before the grace period"
    );
    let container = engine.container(&id).unwrap();
    assert_eq!(container.status(), ContainerStatus::Stopped);
    assert_eq!(container.state.pid(), None);
    assert!(!ws.exists(), "workspace must be removed");
    assert_eq!(engine.lifecycle().running_count(), 0);
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "trap '' TERM; while :; do sleep 1; done").await;
    let id = engine.start_container_from_image(&image.id, 60, 64).unwrap();

    // let the script install its trap
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    engine.stop_container(&id).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= GRACE, "stop returned before the grace period: {:?}", elapsed);
    assert!(elapsed < GRACE + Duration::from_secs(5), "stop took {:?}", elapsed);
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
}

#[tokio::test]
async fn test_double_stop_is_noop() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "sleep 30").await;
    let id = engine.start_container_from_image(&image.id, 5, 64).unwrap();

    engine.stop_container(&id).await.unwrap();
    let first = engine.container(&id).unwrap().state;
    engine.stop_container(&id).await.unwrap();

    assert_eq!(engine.container(&id).unwrap().state, first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_racing_start_leaves_no_process() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "sleep 30").await;
    let handle = tokio::runtime::Handle::current();

    for _ in 0..20 {
        let id = engine.create_container(&image.id, None).unwrap();
        let ws = workspace(&engine, &id);

        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = handle.enter();
                match engine.start_container(&id, 5, 64) {
                    Ok(_) | Err(Error::InvalidState { .. }) => {}
                    Err(e) => panic!("unexpected start error: {}", e),
                }
            });
            s.spawn(|| handle.block_on(engine.stop_container(&id)).unwrap());
        });

        assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
        assert_eq!(engine.lifecycle().running_count(), 0, "a process handle outlived stop");
        assert!(!ws.exists());
    }
}

#[tokio::test]
async fn test_stop_prepared_container() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;
    let id = engine.create_container(&image.id, None).unwrap();
    let ws = workspace(&engine, &id);

    engine.stop_container(&id).await.unwrap();

    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
    assert!(!ws.exists());
}

#[tokio::test]
async fn test_stop_tolerates_missing_workspace() {
    let temp = TempDir::new().unwrap();
    let (engine, image) = engine_with_image(&temp, "true").await;
    let id = engine.create_container(&image.id, None).unwrap();
    fs::remove_dir_all(workspace(&engine, &id)).unwrap();

    engine.stop_container(&id).await.unwrap();
    assert_eq!(engine.container(&id).unwrap().status(), ContainerStatus::Stopped);
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let temp = TempDir::new().unwrap();
    let (engine, _image) = engine_with_image(&temp, "true").await;

    assert!(engine.create_container("missing", None).unwrap_err().is_not_found());
    assert!(engine.start_container_from_image("missing", 5, 64).unwrap_err().is_not_found());
    assert!(engine.start_container("missing", 5, 64).unwrap_err().is_not_found());
    assert!(engine.stop_container("missing").await.unwrap_err().is_not_found());
    assert!(engine.poll_exit("missing").unwrap_err().is_not_found());
    assert!(engine.container("missing").unwrap_err().is_not_found());
}
