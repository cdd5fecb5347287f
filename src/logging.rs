use flexi_logger::{opt_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

/// Rotating file logger for the control plane. The returned handle must
/// stay alive for the duration of the run.
pub fn setup_logging(directory: &str) -> Option<LoggerHandle> {
    let started = Logger::try_with_env_or_str("info").and_then(|logger| {
        logger
            .log_to_file(FileSpec::default().directory(directory))
            .duplicate_to_stderr(Duplicate::Warn)
            .format(opt_format)
            .rotate(
                Criterion::Size(10 * 1024 * 1024), // Rotate logs after they reach 10 MB
                Naming::Numbers,
                Cleanup::KeepLogFiles(7),
            )
            .start()
    });
    match started {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("logging setup failed ({err}); continuing without a log file");
            None
        }
    }
}

/// Stderr-only logging for worker subprocesses; the parent owns the run
/// log.
pub fn setup_worker_logging() -> Option<LoggerHandle> {
    Logger::try_with_env_or_str("warn")
        .and_then(|logger| logger.start())
        .ok()
}
