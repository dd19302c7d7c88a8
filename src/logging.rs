//! Structured logging: a human-readable console layer filtered by `-v`/
//! `RUST_LOG`, plus a daily-rotating file layer under `<state_dir>/state/logs/`
//! once the state directory is known. Old rotated logs are gzip-compressed in
//! the background on startup.

use std::io::{self, IsTerminal, Write};
use std::path::Path;

use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::cli::ColorChoice;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the global tracing subscriber. `logs_dir` is `None` until the
/// state directory is resolved, in which case only the console layer runs.
pub fn init_logging(verbosity: u8, color: ColorChoice, logs_dir: Option<&Path>) -> LogGuard {
    tracing_log::LogTracer::init().expect("failed to install log tracer");

    let console_filter = match verbosity {
        0 => "info",
        1 => "info,catnip_core=debug",
        2 => "info,catnip_core=trace",
        _ => "trace",
    };

    let console_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .with_target(false)
        .with_thread_names(false)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard = None;

    let file_layer = logs_dir.and_then(|dir| {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                compress_old_logs(dir, "catnipd");

                let file_appender = tracing_appender::rolling::Builder::new()
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .filename_prefix("catnipd")
                    .filename_suffix("log")
                    .build(dir)
                    .expect("failed to create rolling file appender");

                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                file_guard = Some(guard);

                Some(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_timer(UtcTime::rfc_3339())
                        .with_target(true)
                        .with_thread_names(true)
                        .with_level(true)
                        .with_filter(EnvFilter::new("debug")),
                )
            }
            Err(err) => {
                eprintln!("warning: could not create log directory {}: {err}", dir.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn compress_old_logs(log_dir: &Path, command_name: &str) {
    let today = {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        since_epoch.as_secs() / 86400
    };

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_owned(),
            None => continue,
        };

        if file_name.ends_with(".log.gz") {
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    let age_days = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| today.saturating_sub(d.as_secs() / 86400))
                        .unwrap_or(0);
                    if age_days > 7 {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
            continue;
        }

        if !file_name.ends_with(".log") || !file_name.starts_with(command_name) {
            continue;
        }

        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                let file_days = modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() / 86400)
                    .unwrap_or(today);
                if file_days >= today {
                    continue;
                }
            }
        }

        let gz_path = path.with_extension("log.gz");
        if let Ok(input) = std::fs::read(&path) {
            let gz_file = match std::fs::File::create(&gz_path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut encoder =
                flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
            if encoder.write_all(&input).is_ok() && encoder.finish().is_ok() {
                let _ = std::fs::remove_file(&path);
            } else {
                let _ = std::fs::remove_file(&gz_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn compress_old_logs_compresses_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let old_file = log_dir.join("catnipd.2020-01-01.log");
        std::fs::write(&old_file, "old log content").unwrap();

        let mtime =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86400 * 18262);
        filetime::set_file_mtime(&old_file, filetime::FileTime::from_system_time(mtime))
            .unwrap_or_default();

        compress_old_logs(log_dir, "catnipd");

        assert!(!old_file.exists(), "original .log file should be deleted");
        let gz_file = log_dir.join("catnipd.2020-01-01.log.gz");
        assert!(gz_file.exists(), ".log.gz file should be created");

        let gz_data = std::fs::read(&gz_file).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&gz_data[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "old log content");
    }

    #[test]
    fn compress_old_logs_skips_today() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let today_file = log_dir.join("catnipd.today.log");
        std::fs::write(&today_file, "today's log").unwrap();

        compress_old_logs(log_dir, "catnipd");

        assert!(today_file.exists(), "today's log should NOT be compressed");
    }
}
