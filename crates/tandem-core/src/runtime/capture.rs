//! Capture of script `print` output during one execution.

use std::sync::{Arc, Mutex};

/// Lines kept per execution; later lines are dropped.
pub const MAX_OUTPUT_LINES: usize = 5_000;

#[derive(Default)]
struct Buffer {
    capturing: bool,
    lines: usize,
    text: String,
}

/// Sink that the engine's `print` callback writes into.
///
/// Outside a capture, printed lines go to the `script` tracing target.
#[derive(Clone, Default)]
pub struct OutputSink {
    inner: Arc<Mutex<Buffer>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one printed line.
    pub fn write_line(&self, line: &str) {
        match self.inner.lock() {
            Ok(mut buf) if buf.capturing => {
                buf.lines += 1;
                if buf.lines <= MAX_OUTPUT_LINES {
                    buf.text.push_str(line);
                    buf.text.push('\n');
                } else if buf.lines == MAX_OUTPUT_LINES + 1 {
                    buf.text.push_str("... output truncated\n");
                }
            }
            _ => tracing::info!(target: "script", "{}", line),
        }
    }

    /// Start capturing. Capture ends when the guard is finished or dropped.
    pub fn capture(&self) -> CaptureGuard<'_> {
        if let Ok(mut buf) = self.inner.lock() {
            buf.capturing = true;
            buf.lines = 0;
            buf.text.clear();
        }
        CaptureGuard { sink: self }
    }

    fn release(&self) -> String {
        match self.inner.lock() {
            Ok(mut buf) => {
                buf.capturing = false;
                std::mem::take(&mut buf.text)
            }
            Err(_) => String::new(),
        }
    }
}

/// Active capture. Dropping it restores uncaptured output.
pub struct CaptureGuard<'a> {
    sink: &'a OutputSink,
}

impl CaptureGuard<'_> {
    /// Stop capturing and return what was printed.
    pub fn finish(self) -> String {
        self.sink.release()
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        let dropped = self.sink.release();
        if !dropped.is_empty() {
            tracing::debug!("Discarded {} bytes of captured script output", dropped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_collects_lines() {
        let sink = OutputSink::new();
        let guard = sink.capture();
        sink.write_line("a");
        sink.write_line("b");
        assert_eq!(guard.finish(), "a\nb\n");
    }

    #[test]
    fn test_capture_caps_lines() {
        let sink = OutputSink::new();
        let guard = sink.capture();
        for i in 0..MAX_OUTPUT_LINES + 10 {
            sink.write_line(&i.to_string());
        }
        let text = guard.finish();
        assert_eq!(text.lines().count(), MAX_OUTPUT_LINES + 1);
        assert!(text.ends_with("... output truncated\n"));
    }

    #[test]
    fn test_drop_releases_capture() {
        let sink = OutputSink::new();
        {
            let _guard = sink.capture();
            sink.write_line("lost");
        }
        sink.write_line("after");
        let guard = sink.capture();
        assert_eq!(guard.finish(), "");
    }
}
