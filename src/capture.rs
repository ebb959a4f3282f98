//! Per-thread output capture for running tasks.
//!
//! A [`CaptureHandle`] registers a fresh buffer for the current thread and
//! unregisters it when dropped. Text reaches the buffer two ways:
//!
//! - the task body writes to the handle (it implements [`std::io::Write`])
//! - tracing events emitted on that thread, when the application installed
//!   [`CaptureRegistry::layer`] in its subscriber
//!
//! Buffers are keyed by thread, so concurrent runs on different threads
//! never see each other's output.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

type Buffers = HashMap<ThreadId, String>;

/// Registry of active capture buffers, shared by handles and the layer.
#[derive(Debug, Clone, Default)]
pub struct CaptureRegistry {
    buffers: Arc<Mutex<Buffers>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start capturing on the current thread, discarding any stale buffer.
    pub fn start(&self, echo: bool) -> CaptureHandle {
        let thread = thread::current().id();
        self.buffers().insert(thread, String::new());
        CaptureHandle {
            registry: self.clone(),
            thread,
            echo,
        }
    }

    /// Append to `thread`'s buffer if it is capturing.
    pub fn append(&self, thread: ThreadId, text: &str) -> bool {
        match self.buffers().get_mut(&thread) {
            Some(buffer) => {
                buffer.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Captured text so far for `thread`.
    pub fn text_for(&self, thread: ThreadId) -> Option<String> {
        self.buffers().get(&thread).cloned()
    }

    /// Unregister `thread`, returning what it captured.
    pub fn stop(&self, thread: ThreadId) -> Option<String> {
        self.buffers().remove(&thread)
    }

    pub fn active(&self) -> usize {
        self.buffers().len()
    }

    /// Tracing layer feeding events into the emitting thread's buffer.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer {
            registry: self.clone(),
        }
    }
}

/// Capture scope for one run on one thread.
#[derive(Debug)]
pub struct CaptureHandle {
    registry: CaptureRegistry,
    thread: ThreadId,
    echo: bool,
}

impl CaptureHandle {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn text(&self) -> String {
        self.registry.text_for(self.thread).unwrap_or_default()
    }

    /// Stop capturing and return the collected text.
    pub fn finish(self) -> String {
        self.registry.stop(self.thread).unwrap_or_default()
    }
}

impl Write for CaptureHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.registry
            .append(self.thread, &String::from_utf8_lossy(buf));
        if self.echo {
            io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.echo {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.registry.stop(self.thread);
    }
}

/// See [`CaptureRegistry::layer`].
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    registry: CaptureRegistry,
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let thread = thread::current().id();
        if self.registry.text_for(thread).is_none() {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{} {}: {}{}\n",
            event.metadata().level(),
            event.metadata().target(),
            visitor.message,
            visitor.fields
        );
        self.registry.append(thread, &line);
    }
}
