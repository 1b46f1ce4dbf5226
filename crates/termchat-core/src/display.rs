//! Display sinks for visible assistant output.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Receives visible text fragments. `render("")` marks the end of a turn.
pub trait DisplaySink: Send {
    fn render(&mut self, text: &str);

    /// Shows or hides the busy indicator while waiting for the first frame.
    fn set_busy(&mut self, _busy: bool) {}
}

/// Writes fragments to stdout with a spinner while the request is pending.
///
/// Spinner state lives on the value, so two displays never share it.
#[derive(Default)]
pub struct TerminalDisplay {
    spinner: Option<ProgressBar>,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.spinner.is_some()
    }
}

impl DisplaySink for TerminalDisplay {
    fn render(&mut self, text: &str) {
        self.set_busy(false);
        let mut out = std::io::stdout().lock();
        if text.is_empty() {
            let _ = writeln!(out, "\n----- End of Response -----");
        } else {
            let _ = write!(out, "{text}");
        }
        let _ = out.flush();
    }

    fn set_busy(&mut self, busy: bool) {
        match (busy, self.spinner.take()) {
            (true, Some(spinner)) => self.spinner = Some(spinner),
            (true, None) => {
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::with_template("{spinner} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner())
                        .tick_chars("|/-\\ "),
                );
                spinner.set_message("waiting for response");
                spinner.enable_steady_tick(Duration::from_millis(100));
                self.spinner = Some(spinner);
            }
            (false, Some(spinner)) => spinner.finish_and_clear(),
            (false, None) => {}
        }
    }
}

/// Records everything it is asked to render. Clones share the same log, so a
/// test can keep one handle and pass the other to the client.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    inner: Arc<Mutex<RecordingState>>,
}

#[derive(Default)]
struct RecordingState {
    rendered: Vec<String>,
    busy: bool,
    busy_toggles: usize,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rendered fragment, including end-of-turn markers (`""`).
    pub fn rendered(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|state| state.rendered.clone())
            .unwrap_or_default()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().map(|state| state.busy).unwrap_or(false)
    }

    pub fn busy_toggles(&self) -> usize {
        self.inner.lock().map(|state| state.busy_toggles).unwrap_or(0)
    }
}

impl DisplaySink for RecordingDisplay {
    fn render(&mut self, text: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state.busy = false;
            state.rendered.push(text.to_string());
        }
    }

    fn set_busy(&mut self, busy: bool) {
        if let Ok(mut state) = self.inner.lock()
            && state.busy != busy
        {
            state.busy = busy;
            state.busy_toggles += 1;
        }
    }
}
