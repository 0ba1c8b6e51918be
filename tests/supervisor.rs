//! Process supervision against real (scripted) child processes: readiness
//! scanning, premature-exit detection, and terminate escalation.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use muster::{MusterError, ProcessSupervisor, SupervisorConfig};

fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

fn supervisor_with(controller: &Path, engines: &Path, grace: Duration) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorConfig {
        controller_program: controller.display().to_string(),
        engine_launcher_program: engines.display().to_string(),
        startup_timeout: Duration::from_secs(5),
        grace_period: grace,
        ..SupervisorConfig::default()
    })
}

#[tokio::test]
async fn controller_readiness_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = write_script(
        dir.path(),
        "controller.sh",
        "#!/bin/sh\n\
         echo \"controller: binding sockets\" >&2\n\
         echo \"controller: subscription started\" >&2\n\
         exec sleep 30\n",
    );
    let engines = write_script(dir.path(), "engines.sh", "#!/bin/sh\nexit 0\n");

    let supervisor = supervisor_with(&controller, &engines, Duration::from_secs(2));
    let child = supervisor
        .spawn_controller("localhost", "cluster_2")
        .await
        .expect("controller should become ready");

    let mut slot = Some(child);
    supervisor.terminate(&mut slot).await;
    assert!(slot.is_none());
}

#[tokio::test]
async fn engine_registrations_are_counted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = write_script(dir.path(), "controller.sh", "#!/bin/sh\nexit 0\n");
    let engines = write_script(
        dir.path(),
        "engines.sh",
        "#!/bin/sh\n\
         echo \"engine: Completed registration rank 0\" >&2\n\
         echo \"engine: noise between markers\" >&2\n\
         echo \"engine: Completed registration rank 1\" >&2\n\
         echo \"engine: Completed registration rank 2\" >&2\n\
         exec sleep 30\n",
    );

    let supervisor = supervisor_with(&controller, &engines, Duration::from_secs(2));
    let child = supervisor
        .spawn_engines("cluster_3", 3)
        .await
        .expect("all three registrations should be seen");

    let mut slot = Some(child);
    supervisor.terminate(&mut slot).await;
}

#[tokio::test]
async fn premature_exit_is_a_launch_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = write_script(
        dir.path(),
        "controller.sh",
        "#!/bin/sh\n\
         echo \"controller: cannot allocate port\" >&2\n\
         exit 7\n",
    );
    let engines = write_script(dir.path(), "engines.sh", "#!/bin/sh\nexit 0\n");

    let supervisor = supervisor_with(&controller, &engines, Duration::from_secs(2));
    let err = supervisor
        .spawn_controller("localhost", "cluster_2")
        .await
        .expect_err("controller died before its marker");
    match err {
        MusterError::ProcessExited { process, status } => {
            assert_eq!(process, "controller");
            assert!(status.contains('7'), "status was {status}");
        }
        other => panic!("expected ProcessExited, got {other:?}"),
    }
}

#[tokio::test]
async fn graceful_termination_honors_sigterm() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = write_script(
        dir.path(),
        "controller.sh",
        "#!/bin/sh\n\
         echo \"controller: subscription started\" >&2\n\
         trap 'exit 0' TERM\n\
         sleep 30 &\n\
         wait $!\n",
    );
    let engines = write_script(dir.path(), "engines.sh", "#!/bin/sh\nexit 0\n");

    let supervisor = supervisor_with(&controller, &engines, Duration::from_secs(5));
    let child = supervisor
        .spawn_controller("localhost", "cluster_2")
        .await
        .expect("ready");

    let started = Instant::now();
    let mut slot = Some(child);
    supervisor.terminate(&mut slot).await;
    // Exited on SIGTERM well inside the grace period; no escalation needed.
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn stubborn_process_is_escalated_to_sigkill() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Ignored signals survive exec, so the sleep inherits the ignored TERM.
    let controller = write_script(
        dir.path(),
        "controller.sh",
        "#!/bin/sh\n\
         echo \"controller: subscription started\" >&2\n\
         trap '' TERM\n\
         exec sleep 30\n",
    );
    let engines = write_script(dir.path(), "engines.sh", "#!/bin/sh\nexit 0\n");

    let supervisor = supervisor_with(&controller, &engines, Duration::from_millis(300));
    let child = supervisor
        .spawn_controller("localhost", "cluster_2")
        .await
        .expect("ready");

    let started = Instant::now();
    let mut slot = Some(child);
    supervisor.terminate(&mut slot).await;
    let elapsed = started.elapsed();
    // Had to wait out the grace period, then SIGKILL finished the job.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn terminate_twice_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = write_script(
        dir.path(),
        "controller.sh",
        "#!/bin/sh\n\
         echo \"controller: subscription started\" >&2\n\
         exec sleep 30\n",
    );
    let engines = write_script(dir.path(), "engines.sh", "#!/bin/sh\nexit 0\n");

    let supervisor = supervisor_with(&controller, &engines, Duration::from_secs(2));
    let child = supervisor
        .spawn_controller("localhost", "cluster_2")
        .await
        .expect("ready");

    let mut slot = Some(child);
    supervisor.terminate(&mut slot).await;
    assert!(slot.is_none());
    // Second call sees the empty slot and does nothing.
    supervisor.terminate(&mut slot).await;
    assert!(slot.is_none());
}
