use log::{Level, Log, Metadata, Record};

static LOGGER: Logger = Logger {
    target_prefix: env!("CARGO_CRATE_NAME"),
};

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {
    // Records from dependencies are only shown when they are warnings or errors.
    target_prefix: &'static str,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(self.target_prefix) || metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let target = record
            .target()
            .strip_prefix(self.target_prefix)
            .and_then(|target| target.strip_prefix("::"))
            .unwrap_or(record.target());
        if record.level() <= Level::Warn {
            eprintln!("{} {} -- {}", record.level(), target, record.args());
        } else {
            println!("{} {} -- {}", record.level(), target, record.args());
        }
    }

    fn flush(&self) {}
}

/// Formats bytes as space-separated hex pairs, for packet dumps.
pub fn fmt_slice_hex(data: &[u8]) -> impl std::fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl std::fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let mut bytes = self.0.iter();
            if let Some(b) = bytes.next() {
                write!(f, "{b:02x}")?;
            }
            bytes.try_for_each(|b| write!(f, " {b:02x}"))
        }
    }
    HexSlice(data)
}
