//! Shutdown signalling shared by the server's own threads.
//!
//! [`StopPipe`] is a self-pipe: stopping writes one byte that is never read,
//! so the read end stays readable and every thread polling it (the monitor
//! and each accept loop) wakes up, now and on any later poll.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of [`StopPipe::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The pipe was signalled.
    Stopped,
    /// The other descriptor is readable.
    Ready,
    /// The timeout elapsed first.
    Timeout,
}

#[derive(Debug)]
pub struct StopPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    signalled: AtomicBool,
}

impl StopPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        open_pipe(&mut fds)?;
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
            signalled: AtomicBool::new(false),
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in fds {
            // SAFETY: `fd` was just returned by pipe(2) and is owned by `pipe`.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(pipe)
    }

    /// Make the read end readable. Later calls do nothing.
    pub fn signal(&self) -> io::Result<()> {
        if self.signalled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let byte = [1u8];
        loop {
            // SAFETY: writes one byte from a live buffer to a descriptor we own.
            let written = unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };
            if written == 1 {
                return Ok(());
            }
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Block until the pipe is signalled, `other` becomes readable, or
    /// `timeout` elapses. `None` waits forever.
    ///
    /// A signalled pipe wins over a ready `other` descriptor.
    pub fn wait(&self, other: Option<RawFd>, timeout: Option<Duration>) -> io::Result<WaitResult> {
        let mut fds = [
            libc::pollfd {
                fd: self.read_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: other.unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let count: libc::nfds_t = if other.is_some() { 2 } else { 1 };
        let timeout_ms: libc::c_int = match timeout {
            Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        loop {
            // SAFETY: `fds` holds `count` initialised pollfd entries.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), count, timeout_ms) };
            if ready < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error);
            }
            if ready == 0 {
                return Ok(WaitResult::Timeout);
            }
            if fds[0].revents != 0 {
                return Ok(WaitResult::Stopped);
            }
            return Ok(WaitResult::Ready);
        }
    }
}

// Close-on-exec is set atomically where pipe2(2) exists.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` is a valid two-element buffer for pipe2(2).
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Drop for StopPipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this value and closed once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Process-wide "stop requested" flag.
#[derive(Debug, Default)]
pub struct ServerStopper {
    stopping: AtomicBool,
}

impl ServerStopper {
    /// Returns `true` for the call that actually requested the stop.
    pub fn request_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Counts the server's own threads that are alive.
#[derive(Debug, Default)]
pub struct ActiveThreadCounter {
    active: AtomicUsize,
}

impl ActiveThreadCounter {
    /// Count the calling thread until the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> ActiveThreadGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveThreadGuard {
            counter: Arc::clone(self),
        }
    }

    pub fn get(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ActiveThreadGuard {
    counter: Arc<ActiveThreadCounter>,
}

impl Drop for ActiveThreadGuard {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_wakes_every_waiter() {
        let pipe = Arc::new(StopPipe::new().unwrap());
        assert_eq!(
            pipe.wait(None, Some(Duration::from_millis(10))).unwrap(),
            WaitResult::Timeout
        );

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pipe = Arc::clone(&pipe);
                thread::spawn(move || pipe.wait(None, Some(Duration::from_secs(10))).unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        pipe.signal().unwrap();
        pipe.signal().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitResult::Stopped);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pipe.wait(None, None).unwrap(), WaitResult::Stopped);
    }

    #[test]
    fn test_pipe_descriptors_are_close_on_exec() {
        let pipe = StopPipe::new().unwrap();
        for fd in [pipe.read_fd, pipe.write_fd] {
            // SAFETY: `fd` is owned by `pipe`, which is alive.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags, -1);
            assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {} lacks FD_CLOEXEC", fd);
        }
    }

    #[test]
    fn test_active_thread_guard_counts() {
        let counter = Arc::new(ActiveThreadCounter::default());
        let first = counter.enter();
        let second = counter.enter();
        assert_eq!(counter.get(), 2);
        drop(first);
        assert_eq!(counter.get(), 1);
        drop(second);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_stopper_reports_first_request_only() {
        let stopper = ServerStopper::default();
        assert!(!stopper.is_stopping());
        assert!(stopper.request_stop());
        assert!(!stopper.request_stop());
        assert!(stopper.is_stopping());
    }
}
