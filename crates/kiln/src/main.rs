//! kiln: run one untrusted executable on a private desktop inside a
//! resource-limited job object and record how it ended.

mod config;
mod logger;
mod result;

use clap::Parser as _;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match config::Config::try_parse() {
        Ok(config) => config,
        Err(error) => {
            let _ = error.print();
            // Help and version requests are successes; parse errors are not.
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    run::run(config)
}

#[cfg(not(windows))]
mod run {
    use crate::{config::Config, logger, result::ExecutionResult};
    use std::process::ExitCode;

    /// Off Windows the configuration still parses and the result record is
    /// still written, but no child can run.
    pub fn run(config: Config) -> ExitCode {
        let log = logger::new(config.log_level);
        let mut execution_result = ExecutionResult::new(config.result_path, log);
        execution_result.set_internal_error(
            "unable to run child process",
            &anyhow::anyhow!("kiln drives Win32 desktops and job objects and only runs on Windows"),
        );
        execution_result.exit(1)
    }
}

#[cfg(windows)]
mod run {
    use crate::{config::Config, logger, result::ExecutionResult};
    use kiln_system::{
        child::ChildProcess,
        desktop::{Desktop, ScopedActivation},
        job::{BasicLimits, Job, Observer},
    };
    use slog::{debug, info, warn, Logger};
    use std::{process::ExitCode, sync::Arc, time::Duration};

    /// Logs the job's lifecycle notifications as they arrive.
    struct LoggingObserver {
        log: Logger,
    }

    impl Observer for LoggingObserver {
        fn on_new_process(&self, process_id: u32) {
            info!(self.log, "process joined the job"; "pid" => process_id);
        }

        fn on_exit_process(&self, process_id: u32) {
            info!(self.log, "process left the job"; "pid" => process_id);
        }

        fn on_abnormal_exit_process(&self, process_id: u32) {
            warn!(self.log, "process exited abnormally"; "pid" => process_id);
        }

        fn on_active_process_zero(&self) {
            info!(self.log, "no processes remain in the job");
        }

        fn on_end_of_job_time(&self) {
            warn!(self.log, "job cpu time limit reached");
        }

        fn on_end_of_process_time(&self, process_id: u32) {
            warn!(self.log, "process cpu time limit reached"; "pid" => process_id);
        }

        fn on_job_memory_limit(&self) {
            warn!(self.log, "job memory limit reached");
        }

        fn on_limit_notification(&self, process_id: u32) {
            warn!(self.log, "job resource limit exceeded"; "pid" => process_id);
        }
    }

    pub fn run(config: Config) -> ExitCode {
        let log = logger::new(config.log_level);
        let mut execution_result =
            ExecutionResult::new(config.result_path.clone(), log.clone());

        let desktop = match Desktop::create(&config.desktop_name, config.desktop_heap_size) {
            Ok(desktop) => desktop,
            Err(error) => {
                execution_result.set_internal_error("unable to create desktop", &error);
                return execution_result.exit(1);
            }
        };
        debug_assert_eq!(
            desktop.name().as_deref(),
            Some(config.desktop_name.as_str()),
            "desktop name readback mismatch"
        );

        let mut job = match Job::new(log.clone()) {
            Ok(job) => job,
            Err(error) => {
                execution_result.set_internal_error("unable to create job object", &error);
                return execution_result.exit(1);
            }
        };
        job.add_observer(Arc::new(LoggingObserver { log: log.clone() }));

        let limits = BasicLimits {
            cpu_time: config
                .limit_cpu_time
                .map(Duration::from_millis)
                .unwrap_or(Duration::MAX),
            overall_memory: config.limit_overall_memory.unwrap_or(u64::MAX),
            per_process_memory: config.limit_per_process_memory.unwrap_or(u64::MAX),
        };
        if let Err(error) = job.set_basic_limits(&limits) {
            execution_result.set_internal_error("unable to set limits on job", &error);
            return execution_result.exit(1);
        }

        let _activation = config.requires_activation.then(|| {
            let activation = ScopedActivation::new(&desktop, &log);
            if !activation.success() {
                warn!(log, "unable to activate desktop for the run");
            }
            activation
        });

        let mut child = ChildProcess::new(&config.child_path, log.clone());
        child.set_arguments(config.child_arguments.iter().cloned());
        let process_id = match child.run(&mut job, Some(&config.desktop_name)) {
            Ok(process_id) => process_id,
            Err(error) => {
                execution_result.set_internal_error("unable to run child process", &error);
                return execution_result.exit(1);
            }
        };
        info!(log, "child process started"; "pid" => process_id);

        let mut exit_code = child.wait(Some(Duration::from_millis(config.child_timeout)));
        if exit_code.is_none() {
            if child.is_alive() {
                execution_result.child_timed_out();
            }
            exit_code = child.terminate();
            if child.was_terminated() {
                debug!(log, "child process was terminated");
            }
        }
        if let Some(exit_code) = exit_code {
            execution_result.child_exit_code(exit_code);
        }

        let outputs = child.outputs().clone();
        execution_result.set_child_stdout(outputs.stdout);
        execution_result.set_child_stderr(outputs.stderr);
        execution_result.exit(0)
    }
}
