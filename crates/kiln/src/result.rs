//! The terminal record of one run, serialized as JSON on exit.

use anyhow::{Context as _, Error, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Serialize;
use slog::{error, Logger};
use std::{fs, path::PathBuf, process::ExitCode};

/// Accumulates the terminal state of a run. The single terminal operation is
/// [`exit`](Self::exit), which consumes the value: there is exactly one
/// serialization per instance.
pub struct ExecutionResult {
    result_path: Option<PathBuf>,
    internal_error: String,
    child_timed_out: bool,
    child_exit_code: Option<i32>,
    child_stdout: Vec<u8>,
    child_stderr: Vec<u8>,
    log: Logger,
}

#[derive(Serialize)]
struct ResultRecord<'a> {
    internal_error: &'a str,
    child_timed_out: bool,
    child_exit_code: Option<i32>,
    child_stdout: String,
    child_stderr: String,
    exit_code: i32,
}

impl ExecutionResult {
    pub fn new(result_path: Option<PathBuf>, log: Logger) -> Self {
        ExecutionResult {
            result_path,
            internal_error: String::new(),
            child_timed_out: false,
            child_exit_code: None,
            child_stdout: Vec::new(),
            child_stderr: Vec::new(),
            log,
        }
    }

    /// Records a fatal setup failure as `"<message>: <cause>"`, where the
    /// cause chain ends in the OS error text.
    pub fn set_internal_error(&mut self, message: &str, error: &Error) {
        self.internal_error = format!("{message}: {error:#}");
    }

    pub fn child_timed_out(&mut self) {
        self.child_timed_out = true;
    }

    pub fn child_exit_code(&mut self, exit_code: i32) {
        self.child_exit_code = Some(exit_code);
    }

    pub fn set_child_stdout(&mut self, bytes: Vec<u8>) {
        self.child_stdout = bytes;
    }

    pub fn set_child_stderr(&mut self, bytes: Vec<u8>) {
        self.child_stderr = bytes;
    }

    /// Writes the result record and returns `code` unchanged. A record that
    /// cannot be written is logged; it never changes the exit code.
    pub fn exit(self, code: u8) -> ExitCode {
        if let Err(error) = self.serialize(i32::from(code)) {
            error!(self.log, "unable to write result record"; "error" => %error);
        }
        ExitCode::from(code)
    }

    fn serialize(&self, exit_code: i32) -> Result<()> {
        let Some(result_path) = &self.result_path else {
            return Ok(());
        };
        let record = ResultRecord {
            internal_error: &self.internal_error,
            child_timed_out: self.child_timed_out,
            child_exit_code: self.child_exit_code,
            child_stdout: BASE64_STANDARD.encode(&self.child_stdout),
            child_stderr: BASE64_STANDARD.encode(&self.child_stderr),
            exit_code,
        };
        let json =
            serde_json::to_string_pretty(&record).context("serializing result record")?;
        fs::write(result_path, json).with_context(|| {
            format!("writing result record to `{}`", result_path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::Value;
    use slog::o;
    use std::io;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn write_record(populate: impl FnOnce(&mut ExecutionResult), code: u8) -> Value {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("result.json");
        let mut result = ExecutionResult::new(Some(path.clone()), test_logger());
        populate(&mut result);
        result.exit(code);
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn decode(value: &Value) -> Vec<u8> {
        BASE64_STANDARD.decode(value.as_str().unwrap()).unwrap()
    }

    #[test]
    fn record_has_exactly_the_six_keys() {
        let record = write_record(|_| {}, 0);
        let object = record.as_object().unwrap();
        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "child_exit_code",
                "child_stderr",
                "child_stdout",
                "child_timed_out",
                "exit_code",
                "internal_error",
            ]
        );
    }

    #[test]
    fn absent_child_exit_code_serializes_as_null() {
        let record = write_record(|_| {}, 0);
        assert_eq!(record["child_exit_code"], Value::Null);
        assert_eq!(record["child_timed_out"], Value::Bool(false));
        assert_eq!(record["internal_error"], "");
        assert_eq!(record["exit_code"], 0);
    }

    #[test]
    fn child_outcome_is_recorded() {
        let record = write_record(
            |result| {
                result.child_timed_out();
                result.child_exit_code(1);
            },
            0,
        );
        assert_eq!(record["child_timed_out"], Value::Bool(true));
        assert_eq!(record["child_exit_code"], 1);
        assert_eq!(record["exit_code"], 0);
    }

    #[test]
    fn streams_round_trip_through_base64() {
        // Nul bytes, high-bit bytes, and a length that is not a multiple of
        // three.
        let stdout = vec![0u8, 1, 2, 0xff, 0xfe, 0x80, 7];
        let stderr = b"plain text".to_vec();
        let record = write_record(
            |result| {
                result.set_child_stdout(stdout.clone());
                result.set_child_stderr(stderr.clone());
            },
            0,
        );
        assert_eq!(decode(&record["child_stdout"]), stdout);
        assert_eq!(decode(&record["child_stderr"]), stderr);
    }

    #[test]
    fn empty_streams_decode_to_empty() {
        let record = write_record(|_| {}, 0);
        assert_eq!(decode(&record["child_stdout"]), b"");
        assert_eq!(decode(&record["child_stderr"]), b"");
    }

    #[test]
    fn base64_output_is_ascii() {
        let record = write_record(
            |result| result.set_child_stdout((0u8..=255).collect()),
            0,
        );
        assert!(record["child_stdout"].as_str().unwrap().is_ascii());
    }

    #[test]
    fn internal_error_carries_the_cause_chain() {
        let record = write_record(
            |result| {
                let error = Error::from(io::Error::from_raw_os_error(5))
                    .context("creating desktop");
                result.set_internal_error("unable to create desktop", &error);
            },
            1,
        );
        let text = record["internal_error"].as_str().unwrap();
        assert!(text.starts_with("unable to create desktop: "));
        assert!(text.contains("os error 5"));
        assert_eq!(record["exit_code"], 1);
    }

    #[test]
    fn missing_result_path_is_tolerated() {
        let mut result = ExecutionResult::new(None, test_logger());
        result.set_internal_error("nothing to write", &anyhow!("oops"));
        let _ = result.exit(1);
    }

    #[test]
    fn unwritable_result_path_is_tolerated() {
        let result = ExecutionResult::new(
            Some(PathBuf::from("this/path/does/not/exist/result.json")),
            test_logger(),
        );
        let _ = result.exit(0);
    }
}
