//! Log output for hosted builds.

use std::io::Write;

use log::LevelFilter;
use spin::Once;

pub struct Console;

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Installs the console as the global logger. Safe to call more than once.
    pub fn init() -> &'static Self {
        let mut installed = false;
        let console = DEFAULT.call_once(|| {
            installed = true;
            Console
        });
        if installed {
            console.install();
        }
        console
    }

    fn install(&'static self) {
        // Another logger may already own the process, e.g. under a test harness.
        if log::set_logger(self).is_err() {
            return;
        }

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(LevelFilter::Info);
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut stderr = std::io::stderr().lock();
        let _ = write_log_entry_to(&mut stderr, record);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> std::io::Result<()> {
    #[cfg(debug_assertions)]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(debug_assertions))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
