use crate::config::LoggingConfig;
use crate::errors::MonitorError;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::sync::Mutex;
use std::sync::Once;

static INIT: Once = Once::new();
static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Initialise log4rs once per process. Later calls return the first outcome.
///
/// The console appender writes to stderr so it does not interleave with the
/// report tables printed on stdout.
pub fn setup_logging(config: &LoggingConfig) -> Result<(), MonitorError> {
    INIT.call_once(|| {
        let result = (|| {
            let level = parse_level(&config.log_level);

            let console = ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(PATTERN)))
                .build();

            let mut builder = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
            let mut root = Root::builder().appender("console");

            if let Some(path) = &config.log_file {
                if let Some(dir) = path.parent() {
                    if !dir.as_os_str().is_empty() {
                        fs::create_dir_all(dir).map_err(|e| format!("Failed to create log directory: {}", e))?;
                    }
                }

                let logfile = FileAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(PATTERN)))
                    .append(true)
                    .build(path)
                    .map_err(|e| format!("Failed to create log file: {}", e))?;

                builder = builder.appender(Appender::builder().build("file", Box::new(logfile)));
                root = root.appender("file");
            }

            let log_config = builder
                .build(root.build(level.unwrap_or(LevelFilter::Info)))
                .map_err(|e| format!("Failed to build log config: {}", e))?;

            log4rs::init_config(log_config).map_err(|e| format!("Logging initialization failed: {}", e))?;

            if level.is_none() {
                log::warn!("Unknown log level '{}', using info", config.log_level);
            }
            Ok(())
        })();

        *INIT_RESULT.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    });

    let guard = INIT_RESULT.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(Ok(())) => Ok(()),
        Some(Err(msg)) => Err(MonitorError::Logging(msg.clone())),
        None => Err(MonitorError::Logging("Logging not initialized".to_string())),
    }
}

// Helper macros for recurring log lines
#[macro_export]
macro_rules! log_classification {
    ($m:expr) => {
        log::debug!(
            "Classified {} -> {} (tier {}, confidence {:.2})",
            $m.ip,
            $m.service_name,
            $m.tier.number(),
            $m.confidence
        );
    };
}

#[macro_export]
macro_rules! log_removal {
    ($event:expr) => {
        log::info!(
            "Device removed: {} ({}) after {} idle ticks, total in={} out={}",
            $event.display_name,
            $event.key,
            $event.idle_ticks,
            $event.bytes_in,
            $event.bytes_out
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
