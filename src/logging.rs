use std::fmt::{self, Write as _};
use std::time::Instant;

use colored::Colorize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Console output for the demo tools.
///
/// Progress and results (INFO) print as bare text so credential lines and
/// monitor columns stay copy-pasteable. Warnings and errors gain a colored
/// `warning:`/`error:` prefix. Diagnostic levels are dimmed and stamped
/// with the elapsed run time so a packet trace on the console can be
/// correlated with the detailed log file.
pub struct ConsoleFormat {
    started: Instant,
}

impl ConsoleFormat {
    /// Starts the elapsed-time clock for diagnostic stamps.
    pub fn new() -> Self {
        ConsoleFormat { started: Instant::now() }
    }
}

impl Default for ConsoleFormat {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the event's `message` field, appending any extra fields as
/// `key=value` pairs.
struct MessageVisitor<'a> {
    line: &'a mut String,
}

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        } else {
            let _ = write!(self.line, " {}={:?}", field.name(), value);
        }
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut line = String::new();
        event.record(&mut MessageVisitor { line: &mut line });

        match *event.metadata().level() {
            Level::INFO => writeln!(writer, "{line}"),
            Level::WARN => {
                writeln!(writer, "{} {}", "warning:".yellow().bold(), line.yellow())
            }
            Level::ERROR => {
                writeln!(writer, "{} {}", "error:".red().bold(), line.red())
            }
            level => {
                let stamp = format!(
                    "[{:>9.3}s {}]",
                    self.started.elapsed().as_secs_f64(),
                    event.metadata().target()
                );
                let line = if level == Level::DEBUG { line.blue() } else { line.purple() };
                writeln!(writer, "{} {}", stamp.dimmed(), line)
            }
        }
    }
}
