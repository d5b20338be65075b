// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-worker workload-size channel.
//!
//! A pipe with both ends non-blocking. The supervisor owns the write end
//! and the worker reads the other end as its stdin. Each update is one
//! native-endian u32, well below PIPE_BUF, so writes are atomic and a full
//! pipe drops the update instead of blocking the control loop. The reader
//! drains everything pending and keeps the last value.
//!
//! Closing the write end doubles as the stop signal: once every pending
//! update has been read the receiver reports `Disconnected`. Because the
//! kernel closes the write end when the supervisor process dies, workers
//! wind down even if the controller never gets to run its cleanup.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

const RECORD_LEN: usize = std::mem::size_of::<u32>();

#[derive(Debug)]
pub enum TrySendError {
    /// The pipe is full, the update was dropped.
    Full,
    /// The reading side is gone.
    Disconnected,
    /// The size does not fit a u32 record, nothing was written.
    TooLarge(usize),
    Io(io::Error),
}

impl fmt::Display for TrySendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full => write!(f, "size channel is full"),
            TrySendError::Disconnected => write!(f, "size channel is disconnected"),
            TrySendError::TooLarge(size) => write!(f, "size {} does not fit the channel", size),
            TrySendError::Io(e) => write!(f, "size channel write failed: {}", e),
        }
    }
}

impl std::error::Error for TrySendError {}

#[derive(Debug)]
pub enum TryRecvError {
    Empty,
    Disconnected,
    Io(io::Error),
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "no pending size update"),
            TryRecvError::Disconnected => write!(f, "size channel is disconnected"),
            TryRecvError::Io(e) => write!(f, "size channel read failed: {}", e),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// Create a pipe with O_NONBLOCK and O_CLOEXEC on both ends.
/// Returns (read_end, write_end).
pub fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Put an inherited descriptor into non-blocking mode.
pub fn set_nonblocking(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct SizeSender {
    pipe: File,
}

impl SizeSender {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            pipe: File::from(fd),
        }
    }

    pub fn try_send(&mut self, size: usize) -> Result<(), TrySendError> {
        let val = u32::try_from(size).map_err(|_| TrySendError::TooLarge(size))?;
        match self.pipe.write(&val.to_ne_bytes()) {
            Ok(RECORD_LEN) => Ok(()),
            // Atomic writes below PIPE_BUF never land partially.
            Ok(_) => Err(TrySendError::Full),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TrySendError::Full),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TrySendError::Disconnected),
            Err(e) => Err(TrySendError::Io(e)),
        }
    }
}

pub struct SizeReceiver<R = File> {
    pipe: R,
    pending: Vec<u8>,
    disconnected: bool,
}

impl SizeReceiver<File> {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(File::from(fd))
    }
}

impl<R: Read> SizeReceiver<R> {
    /// `pipe` must already be in non-blocking mode.
    pub fn new(pipe: R) -> Self {
        Self {
            pipe,
            pending: Vec::with_capacity(RECORD_LEN * 4),
            disconnected: false,
        }
    }

    /// Drain every pending update and return the most recent one.
    pub fn try_recv(&mut self) -> Result<usize, TryRecvError> {
        if !self.disconnected {
            let mut buf = [0u8; 256];
            loop {
                match self.pipe.read(&mut buf) {
                    Ok(0) => {
                        self.disconnected = true;
                        break;
                    }
                    Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(TryRecvError::Io(e)),
                }
            }
        }

        let nr_full = self.pending.len() / RECORD_LEN * RECORD_LEN;
        let latest = self.pending[..nr_full]
            .chunks_exact(RECORD_LEN)
            .last()
            .map(|rec| u32::from_ne_bytes([rec[0], rec[1], rec[2], rec[3]]) as usize);
        self.pending.drain(..nr_full);

        match latest {
            Some(size) => Ok(size),
            None if self.disconnected => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }
}

/// A connected sender/receiver pair inside the current process.
pub fn size_channel() -> io::Result<(SizeSender, SizeReceiver)> {
    let (rd, wr) = create_pipe()?;
    Ok((SizeSender::from_fd(wr), SizeReceiver::from_fd(rd)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_delivered_once() {
        let (mut tx, mut rx) = size_channel().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        tx.try_send(500).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 500);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_last_write_wins() {
        let (mut tx, mut rx) = size_channel().unwrap();
        for size in [200, 500, 1000, 1500] {
            tx.try_send(size).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), 1500);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_close_after_update() {
        let (mut tx, mut rx) = size_channel().unwrap();
        tx.try_send(1000).unwrap();
        drop(tx);
        assert_eq!(rx.try_recv().unwrap(), 1000);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_full_pipe_drops_without_blocking() {
        let (mut tx, mut rx) = size_channel().unwrap();
        let mut sent = 0;
        loop {
            match tx.try_send(sent + 1) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full) => break,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(sent > 0);
        assert_eq!(rx.try_recv().unwrap(), sent);
    }

    #[test]
    fn test_oversized_update_rejected() {
        let (mut tx, mut rx) = size_channel().unwrap();
        let size = u32::MAX as usize + 10;
        assert!(matches!(tx.try_send(size), Err(TrySendError::TooLarge(s)) if s == size));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        tx.try_send(u32::MAX as usize).unwrap();
        assert_eq!(rx.try_recv().unwrap(), u32::MAX as usize);
    }

    #[test]
    fn test_send_to_closed_receiver() {
        let (mut tx, rx) = size_channel().unwrap();
        drop(rx);
        assert!(matches!(tx.try_send(200), Err(TrySendError::Disconnected)));
    }

    #[test]
    fn test_partial_record_is_kept() {
        let bytes: Vec<u8> = 700u32
            .to_ne_bytes()
            .iter()
            .chain(900u32.to_ne_bytes()[..2].iter())
            .cloned()
            .collect();
        let mut rx = SizeReceiver::new(io::Cursor::new(bytes));
        assert_eq!(rx.try_recv().unwrap(), 700);
        assert_eq!(rx.pending.len(), 2);
    }
}
