// src/capture.rs
//
// =============================================================================
// RUNSCRIBE: OUTPUT CAPTURE ROUTER
// =============================================================================
//
// Tees standard output and standard error into per-run log files.
//
// Model:
// - One process-wide `OutputRouter` owns the original console streams and an
//   explicit stack of capture layers (one appendable sink per layer).
// - While that router has layers, file descriptors 1 and 2 are redirected
//   into it (see `redirect`), so plain `println!`, library output and
//   inherited child processes are teed too.
// - Every write reaches the console exactly once, then every active sink from
//   outermost to innermost.
// - `CaptureScope` is the RAII handle of one layer. Layers close in strict
//   reverse order of opening.
//
// Sink failures never reach the caller: a sink that fails a write is marked
// broken and skipped until its layer closes. Console visibility always wins.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::CaptureError;
use crate::redirect::{self, FdCapture};

// ============================================================================
// 1. STREAMS & LAYERS
// ============================================================================

/// The two process streams a capture layer duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

struct Layer {
    id: u64,
    sink: Box<dyn Write + Send>,
    broken: bool,
}

impl Layer {
    fn write_best_effort(&mut self, buf: &[u8]) {
        if self.broken {
            return;
        }
        if self.sink.write_all(buf).is_err() {
            self.broken = true;
        }
    }

    fn flush_best_effort(&mut self) {
        if !self.broken && self.sink.flush().is_err() {
            self.broken = true;
        }
    }
}

struct RouterState {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    // Outermost first.
    layers: Vec<Layer>,
    // Installed with the first layer, removed with the last.
    fd: Option<FdCapture>,
}

impl RouterState {
    fn console(&mut self, stream: Stream) -> &mut (dyn Write + Send) {
        match stream {
            Stream::Stdout => self.stdout.as_mut(),
            Stream::Stderr => self.stderr.as_mut(),
        }
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// Pops every layer from the top down to (and including) `idx`.
    fn truncate_from(&mut self, idx: usize) {
        while self.layers.len() > idx {
            if let Some(mut layer) = self.layers.pop() {
                layer.flush_best_effort();
            }
        }
    }
}

// ============================================================================
// 2. THE ROUTER (Process-wide state)
// ============================================================================

pub struct OutputRouter {
    state: Mutex<RouterState>,
    next_id: AtomicU64,
    // Only the process-wide router redirects the real descriptors.
    fd_capture: bool,
}

impl OutputRouter {
    /// A router over arbitrary console writers. Used directly by tests; the
    /// process-wide instance is built by [`OutputRouter::global`].
    pub fn new(
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(RouterState {
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
                layers: Vec::new(),
                fd: None,
            }),
            next_id: AtomicU64::new(1),
            fd_capture: false,
        }
    }

    /// The process-wide router bound to the real stdout/stderr.
    ///
    /// Initialised lazily on first use and never torn down. Its console
    /// writers are duplicates of fds 1 and 2 taken at that point, so they keep
    /// reaching the terminal while the descriptors themselves are redirected.
    pub fn global() -> &'static OutputRouter {
        static GLOBAL: OnceLock<OutputRouter> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let mut router = match (
                redirect::console(Stream::Stdout),
                redirect::console(Stream::Stderr),
            ) {
                (Some(out), Some(err)) => OutputRouter::new(out, err),
                _ => OutputRouter::new(io::stdout(), io::stderr()),
            };
            router.fd_capture = cfg!(unix);
            router
        })
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // A panic mid-write leaves the stack itself consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new capture layer on top of the current destination set.
    pub fn enter(&self, sink: impl Write + Send + 'static) -> CaptureScope<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        let mut fd_error = None;
        if self.fd_capture && state.layers.is_empty() && state.fd.is_none() {
            match FdCapture::install(OutputRouter::global()) {
                Ok(fd) => state.fd = Some(fd),
                Err(e) => fd_error = Some(e),
            }
        }
        state.layers.push(Layer {
            id,
            sink: Box::new(sink),
            broken: false,
        });
        let depth = state.layers.len();
        drop(state);
        // Logging goes through this router; never while holding its lock.
        if let Some(e) = fd_error {
            log::warn!("Only routed writes will be captured: redirecting stdout/stderr failed: {}", e);
        }
        CaptureScope {
            router: self,
            id,
            depth,
            closed: false,
        }
    }

    /// Opens `path` for append (creating it) and enters a layer on it.
    pub fn enter_file(&self, path: impl AsRef<Path>) -> io::Result<CaptureScope<'_>> {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(self.enter(file))
    }

    /// Number of active layers.
    pub fn depth(&self) -> usize {
        self.lock().layers.len()
    }

    /// Writes `buf` to the console once, then to every active sink.
    ///
    /// Only console errors are returned.
    pub fn write(&self, stream: Stream, buf: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        let console = state.console(stream).write_all(buf);
        for layer in state.layers.iter_mut() {
            layer.write_best_effort(buf);
        }
        console
    }

    pub fn write_fmt(&self, stream: Stream, args: fmt::Arguments<'_>) -> io::Result<()> {
        match args.as_str() {
            Some(s) => self.write(stream, s.as_bytes()),
            None => self.write(stream, args.to_string().as_bytes()),
        }
    }

    pub fn flush(&self, stream: Stream) -> io::Result<()> {
        let mut state = self.lock();
        let console = state.console(stream).flush();
        for layer in state.layers.iter_mut() {
            layer.flush_best_effort();
        }
        console
    }

    /// A `Write` handle that routes through this router.
    pub fn writer(&self, stream: Stream) -> TeeWriter<'_> {
        TeeWriter {
            router: self,
            stream,
        }
    }

    fn exit(&self, id: u64) -> Result<(), CaptureError> {
        let state = self.lock();
        let Some(idx) = state.position(id) else {
            // Already unwound by an outer scope.
            return Ok(());
        };
        let top = state.layers.len() - 1;
        if idx != top {
            return Err(CaptureError::OutOfOrder {
                depth: idx + 1,
                innermost: top + 1,
            });
        }
        self.pop_from(state, id, idx);
        Ok(())
    }

    fn unwind(&self, id: u64) {
        let state = self.lock();
        if let Some(idx) = state.position(id) {
            self.pop_from(state, id, idx);
        }
    }

    /// Pops layers down to `idx`. When that empties the stack the descriptors
    /// are restored first, with the lock released, so bytes still in the pipes
    /// drain into the sinks that were active when they were written.
    fn pop_from<'a>(&'a self, mut state: MutexGuard<'a, RouterState>, id: u64, mut idx: usize) {
        if idx == 0 {
            if let Some(fd) = state.fd.take() {
                drop(state);
                fd.restore();
                state = self.lock();
                match state.position(id) {
                    Some(now) => idx = now,
                    None => return,
                }
            }
        }
        state.truncate_from(idx);
    }
}

// ============================================================================
// 3. THE SCOPE HANDLE (RAII)
// ============================================================================

/// One active capture layer.
///
/// Closing restores the destination set that was active right before the
/// layer was opened. `close` refuses to close a layer that still has layers
/// above it; dropping such a handle instead unwinds those inner layers with it.
#[must_use = "the capture layer closes as soon as the scope is dropped"]
pub struct CaptureScope<'r> {
    router: &'r OutputRouter,
    id: u64,
    depth: usize,
    closed: bool,
}

impl<'r> CaptureScope<'r> {
    /// 1 for the outermost layer.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes this layer. A second call is a no-op.
    pub fn close(&mut self) -> Result<(), CaptureError> {
        if self.closed {
            return Ok(());
        }
        self.router.exit(self.id)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.router.unwind(self.id);
            self.closed = true;
        }
    }
}

// ============================================================================
// 4. WRITER ADAPTER & PRINT HELPERS
// ============================================================================

pub struct TeeWriter<'r> {
    router: &'r OutputRouter,
    stream: Stream,
}

impl Write for TeeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.router.write(self.stream, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.router.flush(self.stream)
    }
}

/// Backs the `tee_println!` family. Console errors are dropped: there is
/// nowhere left to report them.
#[doc(hidden)]
pub fn print_to(stream: Stream, args: fmt::Arguments<'_>) {
    let _ = OutputRouter::global().write_fmt(stream, args);
}

/// `println!` through the process-wide capture router.
#[macro_export]
macro_rules! tee_println {
    () => {
        $crate::capture::print_to($crate::capture::Stream::Stdout, format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::capture::print_to(
            $crate::capture::Stream::Stdout,
            format_args!("{}\n", format_args!($($arg)*)),
        )
    };
}

/// `eprintln!` through the process-wide capture router.
#[macro_export]
macro_rules! tee_eprintln {
    () => {
        $crate::capture::print_to($crate::capture::Stream::Stderr, format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::capture::print_to(
            $crate::capture::Stream::Stderr,
            format_args!("{}\n", format_args!($($arg)*)),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Shared {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Failing;

    impl Write for Failing {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broken_sink_does_not_hide_console_or_siblings() {
        let console = Shared::default();
        let router = OutputRouter::new(console.clone(), Shared::default());
        let good = Shared::default();

        let _outer = router.enter(good.clone());
        let _inner = router.enter(Failing);
        router.write(Stream::Stdout, b"one\n").unwrap();
        router.write(Stream::Stdout, b"two\n").unwrap();

        assert_eq!(console.text(), "one\ntwo\n");
        assert_eq!(good.text(), "one\ntwo\n");
    }

    #[test]
    fn stderr_goes_to_the_same_sink() {
        let out = Shared::default();
        let err = Shared::default();
        let router = OutputRouter::new(out.clone(), err.clone());
        let sink = Shared::default();

        let mut scope = router.enter(sink.clone());
        router.write(Stream::Stdout, b"o\n").unwrap();
        router.write(Stream::Stderr, b"e\n").unwrap();
        scope.close().unwrap();

        assert_eq!(out.text(), "o\n");
        assert_eq!(err.text(), "e\n");
        assert_eq!(sink.text(), "o\ne\n");
    }

    #[test]
    fn depth_marks_outermost() {
        let router = OutputRouter::new(io::sink(), io::sink());
        let outer = router.enter(io::sink());
        let inner = router.enter(io::sink());
        assert!(outer.is_outermost());
        assert!(!inner.is_outermost());
        assert_eq!(inner.depth(), 2);
    }
}
