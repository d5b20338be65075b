// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::warn;

use crate::channel::set_nonblocking;
use crate::channel::SizeReceiver;
use crate::channel::TryRecvError;
use crate::load::LoadGenerator;
use crate::load::MatrixBurner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub nr_burns: u64,
    pub nr_failures: u64,
    pub nr_size_updates: u64,
}

pub struct Worker<R: Read = File> {
    id: usize,
    size: usize,
    sizes: SizeReceiver<R>,
    stop: Arc<AtomicBool>,
    stats: WorkerStats,
}

impl<R: Read> Worker<R> {
    pub fn new(id: usize, size: usize, sizes: SizeReceiver<R>, stop: Arc<AtomicBool>) -> Self {
        Self {
            id,
            size,
            sizes,
            stop,
            stats: WorkerStats::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn poll_size(&mut self) -> Result<()> {
        match self.sizes.try_recv() {
            Ok(0) => warn!("worker {}: ignoring zero size update", self.id),
            Ok(size) => {
                if size != self.size {
                    debug!("worker {}: size {} -> {}", self.id, self.size, size);
                }
                self.size = size;
                self.stats.nr_size_updates += 1;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                debug!("worker {}: size channel closed, stopping", self.id);
                self.stop.store(true, Ordering::Relaxed);
            }
            Err(TryRecvError::Io(e)) => {
                return Err(e).context("Failed to read size channel");
            }
        }
        Ok(())
    }

    /// Burn until stopped. Stop is checked before every iteration, a burn
    /// already in progress always completes.
    pub fn run(&mut self, gen: &mut dyn LoadGenerator) -> Result<WorkerStats> {
        while !self.stop.load(Ordering::Relaxed) {
            self.poll_size()?;
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            self.stats.nr_burns += 1;
            if let Err(e) = gen.burn(self.size) {
                self.stats.nr_failures += 1;
                warn!("worker {}: {}", self.id, e);
            }
        }
        Ok(self.stats)
    }
}

fn ignore_sigint() {
    // SIGTERM keeps its default action so the supervisor can still stop us.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

fn flush_all() {
    log::logger().flush();
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

/// Entry point of a worker process. Size updates arrive on stdin.
pub fn run_worker_process(id: usize, size: usize) -> Result<()> {
    ignore_sigint();

    let res = (|| -> Result<WorkerStats> {
        let stdin = std::io::stdin();
        let fd = stdin.as_raw_fd();
        set_nonblocking(fd).context("Failed to make stdin non-blocking")?;
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to dup stdin");
        }
        // SAFETY: dup returned a fresh descriptor that nothing else owns.
        let sizes = SizeReceiver::from_fd(unsafe { OwnedFd::from_raw_fd(dup) });

        let stop = Arc::new(AtomicBool::new(false));
        let mut worker = Worker::new(id, size, sizes, stop);
        debug!("worker {} started (pid {}) size={}", id, std::process::id(), size);
        worker.run(&mut MatrixBurner::default())
    })();

    match res {
        Ok(stats) => {
            debug!(
                "worker {} exiting: burns={} failures={} updates={}",
                id, stats.nr_burns, stats.nr_failures, stats.nr_size_updates
            );
            flush_all();
            Ok(())
        }
        Err(e) => {
            error!("worker {}: {:#}", id, e);
            flush_all();
            Err(e)
        }
    }
}
