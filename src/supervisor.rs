// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::trace;

use crate::channel::create_pipe;
use crate::channel::SizeSender;
use crate::channel::TrySendError;
use crate::policy::Action;
use crate::policy::ActionKind;

/// How long a worker gets to exit after SIGTERM before it is SIGKILLed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);
const TERMINATE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum ProcessError {
    NoCpus,
    Pipe(io::Error),
    Spawn { id: usize, err: io::Error },
    Stopped,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NoCpus => write!(f, "logical core count must be non-zero"),
            ProcessError::Pipe(e) => write!(f, "failed to create size channel: {}", e),
            ProcessError::Spawn { id, err } => write!(f, "failed to spawn worker {}: {}", id, err),
            ProcessError::Stopped => write!(f, "supervisor is stopped"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Pipe(e) | ProcessError::Spawn { err: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Program and arguments used to launch one worker process. `{id}` and
/// `{size}` in any argument are substituted per worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-execute the running binary's hidden worker subcommand, passing
    /// the controller's verbosity along.
    pub fn current_exe(verbose: u8) -> io::Result<Self> {
        let mut cmd = Self::new(std::env::current_exe()?);
        for _ in 0..verbose {
            cmd = cmd.arg("-v");
        }
        Ok(cmd
            .arg("worker")
            .arg("--id")
            .arg("{id}")
            .arg("--size")
            .arg("{size}"))
    }

    fn build(&self, id: usize, size: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in self.args.iter() {
            let expanded = arg
                .to_string_lossy()
                .replace("{id}", &id.to_string())
                .replace("{size}", &size.to_string());
            cmd.arg(expanded);
        }
        cmd
    }
}

/// A live worker process. Only the supervisor creates and drops these.
pub struct WorkerHandle {
    id: usize,
    child: Child,
    sender: Option<SizeSender>,
    running: bool,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn try_send(&mut self, size: usize) -> Result<(), TrySendError> {
        match self.sender.as_mut() {
            Some(sender) => sender.try_send(size),
            None => Err(TrySendError::Disconnected),
        }
    }

    /// Returns the exit status if the process already exited on its own.
    fn try_reap(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.running = false;
                Some(status)
            }
            _ => None,
        }
    }

    /// Close the size channel, SIGTERM, wait up to `grace`, then SIGKILL
    /// and reap. Best effort, errors are only logged.
    pub fn terminate(&mut self, grace: Duration) {
        self.sender.take();
        if !self.running {
            return;
        }
        self.running = false;

        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        let pid = self.child.id() as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGTERM) } < 0 {
            debug!(
                "worker {}: SIGTERM failed: {}",
                self.id,
                io::Error::last_os_error()
            );
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(TERMINATE_POLL);
                }
                Err(e) => {
                    debug!("worker {}: wait failed: {}", self.id, e);
                    break;
                }
            }
        }

        debug!("worker {} did not exit in {:?}, killing", self.id, grace);
        if let Err(e) = self.child.kill() {
            debug!("worker {}: SIGKILL failed: {}", self.id, e);
        }
        if let Err(e) = self.child.wait() {
            debug!("worker {}: reap failed: {}", self.id, e);
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.running {
            self.terminate(TERMINATE_GRACE);
        }
    }
}

/// Owns the set of worker processes and scales it between `nr_cpus` and
/// `2 * nr_cpus`, one worker per call.
pub struct ProcessSupervisor {
    nr_cpus: usize,
    command: WorkerCommand,
    workers: Vec<WorkerHandle>,
    next_id: usize,
    /// Set once by cleanup, never cleared. Workers observe it as EOF on
    /// their size channel.
    stopped: bool,
    grace: Duration,
    nr_dropped_updates: u64,
    nr_spawn_failures: u64,
}

impl ProcessSupervisor {
    pub fn new(nr_cpus: usize, command: WorkerCommand) -> Result<Self, ProcessError> {
        if nr_cpus == 0 {
            return Err(ProcessError::NoCpus);
        }
        Ok(Self {
            nr_cpus,
            command,
            workers: Vec::new(),
            next_id: 0,
            stopped: false,
            grace: TERMINATE_GRACE,
            nr_dropped_updates: 0,
            nr_spawn_failures: 0,
        })
    }

    pub fn set_terminate_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn max_workers(&self) -> usize {
        self.nr_cpus * 2
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn nr_dropped_updates(&self) -> u64 {
        self.nr_dropped_updates
    }

    pub fn nr_spawn_failures(&self) -> u64 {
        self.nr_spawn_failures
    }

    /// Start one worker running `size` unless the cap is reached. Returns
    /// whether a worker was started.
    pub fn spawn(&mut self, size: usize) -> Result<bool, ProcessError> {
        if self.is_stopped() {
            return Err(ProcessError::Stopped);
        }
        if self.workers.len() >= self.max_workers() {
            return Ok(false);
        }

        let id = self.next_id;
        let (rd, wr) = create_pipe().map_err(ProcessError::Pipe)?;
        let mut sender = SizeSender::from_fd(wr);

        let mut cmd = self.command.build(id, size);
        // Own process group: a terminal Ctrl+C must only reach the controller.
        cmd.stdin(Stdio::from(rd)).process_group(0);
        let child = cmd
            .spawn()
            .map_err(|err| ProcessError::Spawn { id, err })?;
        self.next_id += 1;

        if let Err(e) = sender.try_send(size) {
            trace!("worker {}: initial size not delivered: {}", id, e);
        }

        debug!("spawned worker {} (pid {}) size={}", id, child.id(), size);
        self.workers.push(WorkerHandle {
            id,
            child,
            sender: Some(sender),
            running: true,
        });
        Ok(true)
    }

    /// Terminate the most recently spawned worker unless at the floor.
    /// Returns whether a worker was removed.
    pub fn remove(&mut self) -> bool {
        if self.workers.len() <= self.nr_cpus {
            return false;
        }
        match self.workers.pop() {
            Some(mut worker) => {
                worker.terminate(self.grace);
                debug!("removed worker {}", worker.id);
                true
            }
            None => false,
        }
    }

    /// Publish `size` to every live worker without blocking. Returns the
    /// number of workers the update reached.
    pub fn broadcast_size(&mut self, size: usize) -> usize {
        let mut delivered = 0;
        for worker in self.workers.iter_mut() {
            match worker.try_send(size) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.nr_dropped_updates += 1;
                    trace!("worker {}: size update dropped: {}", worker.id, e);
                }
            }
        }
        delivered
    }

    /// Realize `action`: at most one spawn (Increase) or removal (Stop),
    /// then broadcast the action's size. A failed spawn is counted and the
    /// pool stays as it is. Only a stopped supervisor is an error.
    pub fn apply(&mut self, action: &Action) -> Result<(), ProcessError> {
        match action.kind {
            ActionKind::Increase => match self.spawn(action.size) {
                Ok(_) => {}
                Err(ProcessError::Stopped) => return Err(ProcessError::Stopped),
                Err(e) => {
                    self.nr_spawn_failures += 1;
                    debug!("{}", e);
                }
            },
            ActionKind::Stop => {
                self.remove();
            }
            ActionKind::Maintain | ActionKind::Reduce => {}
        }
        self.broadcast_size(action.size);
        Ok(())
    }

    /// Forget workers that exited on their own and return their ids and
    /// exit statuses. Reporting is left to the caller.
    pub fn reap(&mut self) -> Vec<(usize, ExitStatus)> {
        let mut exited = vec![];
        self.workers.retain_mut(|worker| match worker.try_reap() {
            Some(status) => {
                exited.push((worker.id, status));
                false
            }
            None => true,
        });
        exited
    }

    /// Set the stop flag and terminate every worker. Safe to call more
    /// than once.
    pub fn cleanup(&mut self) {
        self.stopped = true;
        if self.workers.is_empty() {
            return;
        }

        info!("Cleaning up {} worker processes", self.workers.len());
        // Close every channel first so all workers start winding down
        // together instead of one grace period at a time.
        for worker in self.workers.iter_mut() {
            worker.sender.take();
        }
        for mut worker in self.workers.drain(..) {
            worker.terminate(self.grace);
        }
        info!("Cleanup complete");
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.cleanup();
    }
}
