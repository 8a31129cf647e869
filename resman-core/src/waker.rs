//! Cross-platform completion notifier.
//!
//! Workers call [`Waker::signal`] once per completed job; the polling thread
//! drains the notifier and can hand its raw descriptor/handle to an
//! application-owned event loop. Backed by a nonblocking pipe on Unix and an
//! auto-reset event on Windows. Signals may coalesce: several `signal` calls
//! can wake a single reader, and nothing in the crate counts them.

#[cfg(unix)]
pub(crate) use unix::{Waker, wait_readable};

#[cfg(windows)]
pub(crate) use windows::{Waker, wait_signaled};

#[cfg(unix)]
mod unix {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    #[derive(Debug)]
    pub(crate) struct Waker {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl Waker {
        pub fn new() -> io::Result<Self> {
            let mut fds = [0; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
            let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
            // Both ends nonblocking: the consumer drains without blocking the
            // polling thread, and a full pipe must never stall a worker.
            set_nonblocking(read.as_raw_fd())?;
            set_nonblocking(write.as_raw_fd())?;
            set_cloexec(read.as_raw_fd())?;
            set_cloexec(write.as_raw_fd())?;
            Ok(Self { read, write })
        }

        /// Wake the consumer. Called from any thread.
        pub fn signal(&self) {
            let byte = [1u8];
            // EAGAIN means the pipe is full, which is as good as signalled.
            unsafe {
                libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1);
            }
        }

        /// Discard any queued wakeups. Never blocks.
        pub fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe {
                    libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n <= 0 {
                    break;
                }
            }
        }

        /// The readable end, for `select`/`poll` in application event loops.
        pub fn raw_fd(&self) -> RawFd {
            self.read.as_raw_fd()
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_cloexec(fd: RawFd) -> io::Result<()> {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until any of `fds` is readable, retrying on `EINTR`.
    pub(crate) fn wait_readable(fds: &[RawFd]) -> io::Result<()> {
        if fds.is_empty() {
            return Ok(());
        }
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        loop {
            let res = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as _, -1) };
            if res >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn signal_then_drain() {
            let waker = Waker::new().unwrap();
            waker.signal();
            waker.signal();
            wait_readable(&[waker.raw_fd()]).unwrap();
            waker.drain();
            // Drained: a nonblocking read must find nothing.
            let mut buf = [0u8; 8];
            let n = unsafe {
                libc::read(waker.raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            assert!(n < 0);
        }

        #[test]
        fn drain_on_empty_does_not_block() {
            let waker = Waker::new().unwrap();
            waker.drain();
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::os::windows::io::RawHandle;
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{
        CreateEventW, INFINITE, SetEvent, WaitForMultipleObjectsEx,
    };

    #[derive(Debug)]
    pub(crate) struct Waker {
        event: HANDLE,
    }

    // The handle is only ever passed to thread-safe win32 calls.
    unsafe impl Send for Waker {}
    unsafe impl Sync for Waker {}

    impl Waker {
        pub fn new() -> io::Result<Self> {
            // Auto-reset, initially unsignalled.
            let event = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
            if event.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { event })
        }

        pub fn signal(&self) {
            unsafe {
                SetEvent(self.event);
            }
        }

        /// Auto-reset events clear themselves when a waiter is released.
        pub fn drain(&self) {}

        pub fn raw_handle(&self) -> RawHandle {
            self.event.cast()
        }
    }

    impl Drop for Waker {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.event);
            }
        }
    }

    /// Block until any of `handles` is signalled (alertable wait).
    pub(crate) fn wait_signaled(handles: &[RawHandle]) -> io::Result<()> {
        if handles.is_empty() {
            return Ok(());
        }
        let res = unsafe {
            WaitForMultipleObjectsEx(
                handles.len() as u32,
                handles.as_ptr().cast(),
                0,
                INFINITE,
                1,
            )
        };
        if res == u32::MAX {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
