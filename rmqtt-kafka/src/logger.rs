use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};

use slog::{o, Drain};

use rmqtt_kafka_conf::logging::{Log, To};

pub use slog::Logger;

/// Route the `log` facade into `logger`; records more verbose than `max` are never built.
pub fn logger_init(logger: Logger, max: slog::Level) -> crate::Result<()> {
    log::set_boxed_logger(Box::new(Bridge(logger)))?;
    log::set_max_level(to_log(max).to_level_filter());
    Ok(())
}

/// Build the root logger described by the `[log]` settings.
pub fn from_settings(log: &Log) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(log.path(), log.to));
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp_local).build().fuse();
    let drain = ModuleFilter { drain, log: log.clone() }.fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(16384)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// Forwards `log` records, which the proxy crates emit, into the slog drain.
struct Bridge(Logger);

impl log::Log for Bridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let location = slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let rs = slog::RecordStatic { location: &location, level: to_slog(r.level()), tag: r.target() };
        self.0.log(&slog::Record::new(&rs, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

const LEVELS: [(log::Level, slog::Level); 5] = [
    (log::Level::Error, slog::Level::Error),
    (log::Level::Warn, slog::Level::Warning),
    (log::Level::Info, slog::Level::Info),
    (log::Level::Debug, slog::Level::Debug),
    (log::Level::Trace, slog::Level::Trace),
];

fn to_slog(level: log::Level) -> slog::Level {
    LEVELS.iter().find(|(l, _)| *l == level).map(|(_, s)| *s).unwrap_or(slog::Level::Info)
}

/// `Critical` has no `log` counterpart and maps to `Error`.
fn to_log(level: slog::Level) -> log::Level {
    LEVELS.iter().find(|(_, s)| *s == level).map(|(l, _)| *l).unwrap_or(log::Level::Error)
}

fn timestamp_local(io: &mut dyn Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Passes records at or above the level configured for their module.
struct ModuleFilter<D> {
    drain: D,
    log: Log,
}

impl<D> Drain for ModuleFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.log.level_for(record.module())) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Console and/or file sink selected by `log.to`. The file is opened on first write.
struct WriteFilter {
    console: Option<Stdout>,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl WriteFilter {
    fn new(path: Option<PathBuf>, to: To) -> Self {
        Self { console: to.console().then(io::stdout), path: path.filter(|_| to.file()), file: None }
    }

    fn file(&mut self) -> io::Result<Option<&mut File>> {
        match (&self.path, self.file.is_some()) {
            (None, _) => Ok(None),
            (Some(_), true) => Ok(self.file.as_mut()),
            (Some(path), false) => {
                let file = open_file(path)?;
                Ok(Some(self.file.insert(file)))
            }
        }
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(console) = self.console.as_mut() {
            console.write_all(buf)?;
        }
        if let Some(file) = self.file()? {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(console) = self.console.as_mut() {
            console.flush()?;
        }
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("cannot open log file {}, {}", path.display(), e)))
}
