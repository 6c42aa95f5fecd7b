// src/redirect.rs
//
// =============================================================================
// RUNSCRIBE: PROCESS-LEVEL STREAM REDIRECTION
// =============================================================================
//
// While the process-wide router has at least one capture layer, file
// descriptors 1 and 2 point at pipes. A pump thread per stream drains its pipe
// through the router, which writes to the saved console descriptors and to
// every active sink. This catches `println!`, direct `io::stdout()` writes,
// output of C libraries and of inherited child processes alike.
//
// Restoring points 1 and 2 back at the console and waits (bounded) for the
// pumps to drain what was still in flight.

use std::fs::File;
use std::io;

use crate::capture::{OutputRouter, Stream};

/// Duplicate of the process's console stream, taken before any redirection.
pub(crate) fn console(stream: Stream) -> Option<File> {
    imp::console(stream)
}

pub(crate) struct FdCapture {
    inner: imp::Inner,
}

impl FdCapture {
    /// Points fds 1 and 2 at pipes drained through `router`.
    pub(crate) fn install(router: &'static OutputRouter) -> io::Result<Self> {
        imp::Inner::install(router).map(|inner| Self { inner })
    }

    /// Points fds 1 and 2 back at the console and drains the pipes.
    pub(crate) fn restore(self) {
        self.inner.restore();
    }
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::Duration;

    use crate::capture::{OutputRouter, Stream};

    // A child that inherited the pipe and outlives the run keeps it open.
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn target_fd(stream: Stream) -> RawFd {
        match stream {
            Stream::Stdout => libc::STDOUT_FILENO,
            Stream::Stderr => libc::STDERR_FILENO,
        }
    }

    /// `dup` with close-on-exec, so children never inherit the copy.
    fn dup_cloexec(fd: RawFd) -> io::Result<File> {
        let new = check(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
        Ok(unsafe { File::from_raw_fd(new) })
    }

    fn pipe_cloexec() -> io::Result<(File, File)> {
        let mut fds = [0 as libc::c_int; 2];
        check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let (reader, writer) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
        for f in [&reader, &writer] {
            check(unsafe { libc::fcntl(f.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
        }
        Ok((reader, writer))
    }

    pub(super) fn console(stream: Stream) -> Option<File> {
        dup_cloexec(target_fd(stream)).ok()
    }

    struct Redirected {
        target: RawFd,
        // Where `target` pointed before redirection.
        saved: File,
        drained: Receiver<()>,
    }

    fn pump(mut reader: File, stream: Stream, router: &'static OutputRouter) {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = router.write(stream, &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = router.flush(stream);
    }

    fn redirect(stream: Stream, router: &'static OutputRouter) -> io::Result<Redirected> {
        let target = target_fd(stream);
        let (reader, writer) = pipe_cloexec()?;
        let saved = dup_cloexec(target)?;

        let (done, drained) = mpsc::channel();
        thread::Builder::new()
            .name(format!("runscribe-{:?}", stream).to_lowercase())
            .spawn(move || {
                pump(reader, stream, router);
                let _ = done.send(());
            })?;

        // On failure `writer` drops here, the pump sees EOF and exits.
        check(unsafe { libc::dup2(writer.as_raw_fd(), target) })?;
        Ok(Redirected {
            target,
            saved,
            drained,
        })
    }

    pub(super) struct Inner {
        streams: Vec<Redirected>,
    }

    impl Inner {
        pub(super) fn install(router: &'static OutputRouter) -> io::Result<Self> {
            let mut streams = Vec::with_capacity(2);
            for stream in [Stream::Stdout, Stream::Stderr] {
                match redirect(stream, router) {
                    Ok(r) => streams.push(r),
                    Err(e) => {
                        Inner { streams }.restore();
                        return Err(e);
                    }
                }
            }
            Ok(Self { streams })
        }

        pub(super) fn restore(self) {
            // Push out whatever std still buffers before the pipes go away.
            let _ = io::stdout().flush();
            let _ = io::stderr().flush();
            for r in &self.streams {
                unsafe {
                    libc::dup2(r.saved.as_raw_fd(), r.target);
                }
            }
            for r in self.streams {
                // On timeout the pipe is still held open elsewhere; late
                // bytes then reach whatever layers are left.
                let _ = r.drained.recv_timeout(DRAIN_TIMEOUT);
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::File;
    use std::io;

    use crate::capture::{OutputRouter, Stream};

    pub(super) fn console(_: Stream) -> Option<File> {
        None
    }

    pub(super) struct Inner;

    impl Inner {
        pub(super) fn install(_: &'static OutputRouter) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "descriptor redirection is only available on unix",
            ))
        }

        pub(super) fn restore(self) {}
    }
}
