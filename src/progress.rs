//! Download progress bars that share the terminal with tracing output.
//!
//! Log lines are routed through the same `MultiProgress` as the bars so a
//! running download stays pinned below the log.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

/// Progress bar for one download. Unknown lengths get a byte spinner.
pub fn download_bar(name: &str, len: Option<u64>) -> ProgressBar {
    let bar = match len {
        Some(len) => {
            let bar = multi_progress().add(ProgressBar::new(len));
            if let Ok(style) = ProgressStyle::with_template(
                "{msg:30!} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        }
        None => {
            let bar = multi_progress().add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::with_template("{spinner} {msg:30!} {bytes}") {
                bar.set_style(style);
            }
            bar
        }
    };
    bar.set_message(name.to_string());
    bar
}

fn emit(line: &str) {
    let _ = multi_progress().println(line.trim_end_matches('\r'));
}

/// `MakeWriter` handing tracing a line-buffered writer over the shared progress target
#[derive(Default, Clone)]
pub struct LogWriterFactory;

pub struct LogWriter {
    pending: String,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.push_str(&String::from_utf8_lossy(buf));
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            emit(line.trim_end_matches('\n'));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            emit(&rest);
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            pending: String::new(),
        }
    }
}
