// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// Runs the real `worker` subcommand of the built binary with tiny sizes.

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use scx_heater::ProcessSupervisor;
use scx_heater::WorkerCommand;

const HEATER: &str = env!("CARGO_BIN_EXE_scx_heater");

fn wait_timeout(child: &mut std::process::Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(HEATER)
        .arg("worker")
        .arg("--id")
        .arg("{id}")
        .arg("--size")
        .arg("{size}")
}

#[test]
fn worker_exits_when_channel_closes() {
    let mut child = Command::new(HEATER)
        .args(["worker", "--id", "0", "--size", "8"])
        .stdin(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(&16u32.to_ne_bytes()).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(child.try_wait().unwrap().is_none(), "worker exited early");

    drop(stdin);
    match wait_timeout(&mut child, Duration::from_secs(10)) {
        Some(status) => assert!(status.success(), "worker failed: {}", status),
        None => {
            child.kill().unwrap();
            panic!("worker kept running after its channel closed");
        }
    }
}

#[test]
fn worker_ignores_sigint_but_obeys_sigterm() {
    let mut child = Command::new(HEATER)
        .args(["worker", "--id", "0", "--size", "8"])
        .stdin(Stdio::piped())
        .spawn()
        .unwrap();
    // Hold the channel open so only signals can stop the worker.
    let _stdin = child.stdin.take().unwrap();
    let pid = child.id() as libc::pid_t;

    // Let the worker install its SIGINT disposition.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(unsafe { libc::kill(pid, libc::SIGINT) }, 0);
    std::thread::sleep(Duration::from_millis(300));
    assert!(child.try_wait().unwrap().is_none(), "worker died on SIGINT");

    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);
    match wait_timeout(&mut child, Duration::from_secs(5)) {
        Some(status) => assert_eq!(status.signal(), Some(libc::SIGTERM)),
        None => {
            child.kill().unwrap();
            panic!("worker ignored SIGTERM");
        }
    }
}

#[test]
fn worker_rejects_bad_arguments() {
    let status = Command::new(HEATER)
        .args(["worker", "--id", "0"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn supervisor_runs_real_workers() {
    let mut sup = ProcessSupervisor::new(1, worker_command()).unwrap();
    assert!(sup.spawn(8).unwrap());
    assert!(sup.spawn(8).unwrap());
    assert!(!sup.spawn(8).unwrap());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.broadcast_size(16), 2);
    assert!(sup.reap().is_empty());

    let pids: Vec<u32> = sup.workers().iter().map(|w| w.pid()).collect();
    sup.cleanup();
    assert!(sup.is_empty());
    for pid in pids {
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }
}
