//! Cargo-style console output for driftsync
//!
//! ```text
//!    Scanning 952 files under ./data
//!     Serving 127.0.0.1:7420 [2 clients] 67.44 MiB sent, in flight: big.iso
//!     Stopped after 3.2s
//! ```

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use driftsync_core::FileProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SCANNING: &str = "Scanning";
    const SCANNED: &str = "Scanned";
    const SERVING: &str = "Serving";
    const STOPPED: &str = "Stopped";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let style = console::Style::new().green().bold();
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// `io::Write` that prints above any live progress bar
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        MULTI.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Console output for `driftsync scan`
pub struct ScanProgress {
    start: Instant,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn scanning(&self, root: &std::path::Path) {
        print_status(Status::SCANNING, &root.display().to_string());
    }

    pub fn finish(&self, files: usize, regions: usize, bytes: u64) {
        print_status(
            Status::SCANNED,
            &format!(
                "{files} files, {regions} regions, {} in {}",
                humansize::format_size(bytes, humansize::BINARY),
                format_elapsed(self.start.elapsed())
            ),
        );
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Live status line for `driftsync serve`
pub struct ServeProgress {
    start: Instant,
    bar: ProgressBar,
}

impl ServeProgress {
    pub fn new(listen: &str) -> Self {
        let bar = MULTI.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {prefix:>10.green.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(Status::SERVING);
        bar.set_message(listen.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            start: Instant::now(),
            bar,
        }
    }

    /// Refresh the status line
    pub fn update(&self, listen: &str, clients: usize, sent: u64, in_flight: &[String]) {
        let mut message = format!(
            "{listen} [{clients} clients] {} sent",
            humansize::format_size(sent, humansize::BINARY)
        );
        if !in_flight.is_empty() {
            message.push_str(", in flight: ");
            message.push_str(&in_flight.join(", "));
        }
        self.bar.set_message(message);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
        print_status(
            Status::STOPPED,
            &format!("after {}", format_elapsed(self.start.elapsed())),
        );
    }
}

/// Render a client's progress report as a table
pub fn render_progress(report: &[FileProgress]) -> String {
    let mut out = format!(
        "{:>7} {:>7} {:>7} {:>7}  {}\n",
        "synced", "meta", "fast", "slow", "file"
    );
    for file in report {
        out.push_str(&format!(
            "{:>6}% {:>6}% {:>6}% {:>6}%  {}\n",
            file.synced_percent,
            file.metadata_received_percent,
            file.fast_up_to_date_percent,
            file.slow_up_to_date_percent,
            file.name
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_progress_lists_every_file() {
        let report = vec![
            FileProgress {
                file_id: 1,
                name: "a.bin".into(),
                synced_percent: 100,
                metadata_received_percent: 100,
                fast_up_to_date_percent: 100,
                slow_up_to_date_percent: 50,
            },
            FileProgress {
                file_id: 2,
                name: "b.bin".into(),
                synced_percent: 0,
                metadata_received_percent: 0,
                fast_up_to_date_percent: 100,
                slow_up_to_date_percent: 0,
            },
        ];
        let table = render_progress(&report);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("a.bin"));
        assert!(lines[1].starts_with("   100%"));
        assert!(lines[2].contains("b.bin"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_millis(3200)), "3.20s");
    }
}
