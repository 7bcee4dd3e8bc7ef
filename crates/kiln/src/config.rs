//! Command-line configuration for one sandboxed run.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Runs one untrusted executable on a private desktop inside a
/// resource-limited job object, captures its standard streams, and writes a
/// JSON record describing how it ended.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the child executable.
    #[arg(long, value_name = "PATH")]
    pub child_path: PathBuf,

    /// Wall-clock limit for the child, in milliseconds.
    #[arg(long, value_name = "MILLISECONDS")]
    pub child_timeout: u64,

    /// Name of the desktop the child is confined to.
    #[arg(long, value_name = "NAME", default_value = "OvenDesktop")]
    pub desktop_name: String,

    /// Heap size of the created desktop, in kilobytes.
    #[arg(long, value_name = "KILOBYTES", default_value_t = 2048)]
    pub desktop_heap_size: u32,

    /// Bring the desktop to the foreground for the duration of the run.
    #[arg(long)]
    pub requires_activation: bool,

    /// Where to write the JSON result record.
    #[arg(long, value_name = "PATH")]
    pub result_path: Option<PathBuf>,

    /// User-mode CPU time limit for the job, in milliseconds. Unlimited when
    /// absent.
    #[arg(long, value_name = "MILLISECONDS")]
    pub limit_cpu_time: Option<u64>,

    /// Committed-memory limit across all processes in the job, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub limit_overall_memory: Option<u64>,

    /// Committed-memory limit for any single process in the job, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub limit_per_process_memory: Option<u64>,

    /// Minimum log level to output.
    #[arg(long, value_name = "LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Arguments passed to the child verbatim.
    #[arg(last = true, value_name = "ARGS")]
    pub child_arguments: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(self) -> slog::Level {
        match self {
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory as _;

    #[test]
    fn command_is_well_formed() {
        Config::command().debug_assert();
    }

    #[test]
    fn defaults_are_applied() {
        let config = Config::try_parse_from([
            "kiln",
            "--child-path",
            "child.exe",
            "--child-timeout",
            "5000",
        ])
        .unwrap();
        assert_eq!(config.desktop_name, "OvenDesktop");
        assert_eq!(config.desktop_heap_size, 2048);
        assert!(!config.requires_activation);
        assert_eq!(config.result_path, None);
        assert_eq!(config.limit_cpu_time, None);
        assert_eq!(config.limit_overall_memory, None);
        assert_eq!(config.limit_per_process_memory, None);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.child_arguments.is_empty());
    }

    #[test]
    fn trailing_arguments_go_to_the_child_verbatim() {
        let config = Config::try_parse_from([
            "kiln",
            "--child-path",
            "child.exe",
            "--child-timeout",
            "5000",
            "--",
            "--flag",
            "value with spaces",
        ])
        .unwrap();
        assert_eq!(config.child_arguments, ["--flag", "value with spaces"]);
    }

    #[test]
    fn child_path_is_required() {
        let error =
            Config::try_parse_from(["kiln", "--child-timeout", "5000"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn child_timeout_is_required() {
        let error =
            Config::try_parse_from(["kiln", "--child-path", "child.exe"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn limits_are_parsed() {
        let config = Config::try_parse_from([
            "kiln",
            "--child-path",
            "child.exe",
            "--child-timeout",
            "5000",
            "--limit-cpu-time",
            "200",
            "--limit-overall-memory",
            "100000000",
            "--limit-per-process-memory",
            "50000000",
            "--requires-activation",
        ])
        .unwrap();
        assert_eq!(config.limit_cpu_time, Some(200));
        assert_eq!(config.limit_overall_memory, Some(100_000_000));
        assert_eq!(config.limit_per_process_memory, Some(50_000_000));
        assert!(config.requires_activation);
    }
}
