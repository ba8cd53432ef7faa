use std::thread;
use std::time::SystemTime;

use log::Level;
use nu_ansi_term::{Color, Style};

use crate::time;

/// Colored stderr logger.
///
/// Every line carries the wall clock (second precision is plenty for a
/// human), the millisecond uptime the stack's timers are driven by, and the
/// emitting thread, so worker, NIC and application threads can be told
/// apart while interleaving.
pub struct Logger;

fn style_of(level: Level) -> Style {
	match level {
		Level::Error => Color::Red.bold(),
		Level::Warn => Color::Yellow.bold(),
		Level::Info => Color::Green.normal(),
		Level::Debug => Color::Blue.normal(),
		Level::Trace => Color::DarkGray.normal(),
	}
}

impl log::Log for Logger {
	fn enabled(&self, metadata: &log::Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let dim = Style::new().dimmed();

		let wall = humantime::format_rfc3339_seconds(SystemTime::now());
		let uptime = format!("+{}ms", time::now_ms());

		let current = thread::current();
		let tag = match current.name() {
			Some(name) => format!(" ({name})"),
			None => String::new(),
		};

		eprintln!(
			"{} {} {} {}{} {}",
			dim.paint(wall.to_string()),
			dim.paint(uptime),
			style_of(record.level()).paint(format!("{:5}", record.level())),
			Style::new().bold().paint(record.target().to_string()),
			dim.paint(tag),
			record.args()
		);
	}

	fn flush(&self) {}
}
