//! Start, supervise, and stop the sandboxed child process.

use crate::{
    handle::ScopedHandle,
    iocp::{duration_to_millis, CompletionPort, WaitResult},
    job::Job,
    pipe::Pipe,
    wide,
};
use anyhow::{Context as _, Result};
use slog::{error, warn, Logger};
use std::{
    ffi::{OsStr, OsString},
    io, mem,
    path::PathBuf,
    ptr, thread,
    time::Duration,
};
use windows_sys::Win32::{
    Foundation::{TRUE, WAIT_OBJECT_0},
    System::Threading::{
        CreateProcessW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
        PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
    },
};

/*              _     _ _
 *  _ __  _   _| |__ | (_) ___
 * | '_ \| | | | '_ \| | |/ __|
 * | |_) | |_| | |_) | | | (__
 * | .__/ \__,_|_.__/|_|_|\___|
 * |_|
 *  FIGLET: public
 */

/// Exit code forced on the child by [`ChildProcess::terminate`].
const KILL_EXIT_CODE: u32 = 1;

/// Everything the child wrote to its standard streams. Append-only while the
/// drain is running, frozen once it is joined.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outputs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Drives one child process: spawn with captured streams, wait with a
/// deadline, terminate if it will not leave, and join the output drain.
pub struct ChildProcess {
    executable_path: PathBuf,
    detached: bool,
    // The executable path doubles as the first argument.
    arguments: Vec<OsString>,
    handle: ScopedHandle,
    drain: Option<thread::JoinHandle<Outputs>>,
    outputs: Option<Outputs>,
    terminated: bool,
    log: Logger,
}

impl ChildProcess {
    pub fn new(executable_path: impl Into<PathBuf>, log: Logger) -> Self {
        Self::new_detached(executable_path, false, log)
    }

    /// A detached child is not waited for when this value is dropped.
    pub fn new_detached(executable_path: impl Into<PathBuf>, detached: bool, log: Logger) -> Self {
        let executable_path = executable_path.into();
        let arguments = vec![executable_path.clone().into_os_string()];
        ChildProcess {
            executable_path,
            detached,
            arguments,
            handle: ScopedHandle::null(),
            drain: None,
            outputs: None,
            terminated: false,
            log,
        }
    }

    pub fn set_arguments(&mut self, arguments: impl IntoIterator<Item = impl Into<OsString>>) {
        self.arguments.extend(arguments.into_iter().map(Into::into));
    }

    /// Joins the arguments with single spaces. Nothing is quoted or escaped;
    /// arguments containing whitespace must be pre-quoted by the caller.
    pub fn render_command_line(&self) -> OsString {
        let mut command_line = OsString::new();
        for (index, argument) in self.arguments.iter().enumerate() {
            if index > 0 {
                command_line.push(OsStr::new(" "));
            }
            command_line.push(argument);
        }
        command_line
    }

    /// Spawns the child with both standard output streams captured, places
    /// it in `job`, and starts the drain thread. Returns the child's pid.
    ///
    /// When `desktop_name` names a desktop on another window station it must
    /// be given as `<window_station>\<desktop>`.
    pub fn run(&mut self, job: &mut Job, desktop_name: Option<&str>) -> Result<u32> {
        let mut startup_info: STARTUPINFOW = unsafe { mem::zeroed() };
        startup_info.cb = mem::size_of::<STARTUPINFOW>() as u32;
        startup_info.dwFlags = STARTF_USESTDHANDLES;

        let stdout_pipe = Pipe::new().context("creating stdout pipe")?;
        let stderr_pipe = Pipe::new().context("creating stderr pipe")?;
        startup_info.hStdOutput = stdout_pipe.write_handle();
        startup_info.hStdError = stderr_pipe.write_handle();

        let desktop_name = desktop_name.map(wide::nul_terminated);
        if let Some(desktop_name) = &desktop_name {
            startup_info.lpDesktop = desktop_name.as_ptr() as *mut u16;
        }

        let application = wide::nul_terminated(&self.executable_path);
        let mut command_line = wide::nul_terminated(self.render_command_line());

        let mut process_info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        let started = unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                TRUE,
                0,
                ptr::null(),
                ptr::null(),
                &startup_info,
                &mut process_info,
            )
        };
        if started == 0 {
            // Leave the child in the same joinable state as a successful
            // run: a failed spawn produced no output.
            self.outputs = Some(Outputs::default());
            return Err(io::Error::last_os_error()).with_context(|| {
                format!("starting child process `{}`", self.executable_path.display())
            });
        }

        // The primary thread handle is never used.
        drop(ScopedHandle::new(process_info.hThread));
        self.handle = ScopedHandle::new(process_info.hProcess);

        if let Err(error) = job.assign_process(self.handle.get()) {
            warn!(self.log, "unable to assign child process to job object"; "error" => %error);
        }

        let drain_log = self.log.clone();
        match thread::Builder::new()
            .name("output-drain".into())
            .spawn(move || drain_outputs(stdout_pipe, stderr_pipe, drain_log))
        {
            Ok(drain) => self.drain = Some(drain),
            Err(error) => {
                self.outputs = Some(Outputs::default());
                warn!(self.log, "unable to spawn output drain thread"; "error" => %error);
            }
        }

        Ok(process_info.dwProcessId)
    }

    /// Waits up to `timeout` (`None` means forever) for the child to exit.
    /// Returns its exit code, or `None` on timeout or when the code could
    /// not be retrieved; either way the process handle stays live so that
    /// [`terminate`](Self::terminate) can still operate on it.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<i32> {
        debug_assert!(self.is_alive(), "cannot wait for a process that was not started");
        let milliseconds = timeout.map(duration_to_millis).unwrap_or(INFINITE);
        let signaled = unsafe { WaitForSingleObject(self.handle.get(), milliseconds) };
        if signaled != WAIT_OBJECT_0 {
            return None;
        }
        let mut exit_code = 0u32;
        if unsafe { GetExitCodeProcess(self.handle.get(), &mut exit_code) } == 0 {
            warn!(self.log, "unable to retrieve child exit code";
                "error" => %io::Error::last_os_error());
            return None;
        }
        self.handle.clear();
        Some(exit_code as i32)
    }

    /// Forcibly ends the child with [`KILL_EXIT_CODE`], then waits to
    /// collect the resulting exit status.
    pub fn terminate(&mut self) -> Option<i32> {
        debug_assert!(self.is_alive(), "cannot terminate a process that was not started");
        if unsafe { TerminateProcess(self.handle.get(), KILL_EXIT_CODE) } == 0 {
            warn!(self.log, "unable to terminate child process";
                "error" => %io::Error::last_os_error());
            return None;
        }
        self.terminated = true;
        self.wait(None)
    }

    /// True from a successful [`run`](Self::run) until the exit code has
    /// been collected.
    pub fn is_alive(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated
    }

    /// Blocks until the drain is complete, then returns what the child
    /// wrote. Call only after the child has exited or been terminated; a
    /// live child can otherwise block on a full pipe while this call blocks
    /// on the drain.
    pub fn outputs(&mut self) -> &Outputs {
        self.retrieve_outputs();
        self.outputs.get_or_insert_with(Outputs::default)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_alive() && !self.detached {
            if self.wait(None).is_none() {
                warn!(self.log, "unable to wait for child process");
            }
        }
        // Make sure the drain thread has joined before the handles go away.
        self.retrieve_outputs();
    }
}

/*             _            _
 *  _ __  _ __(_)_   ____ _| |_ ___
 * | '_ \| '__| \ \ / / _` | __/ _ \
 * | |_) | |  | |\ V / (_| | ||  __/
 * | .__/|_|  |_| \_/ \__,_|\__\___|
 * |_|
 *  FIGLET: private
 */

const READ_BUFFER_SIZE: usize = 4096;

struct StreamContext {
    pipe: Pipe,
    buffer: [u8; READ_BUFFER_SIZE],
    bytes: Vec<u8>,
    done: bool,
}

impl StreamContext {
    fn new(mut pipe: Pipe) -> Self {
        // The parent's copy of the write end has to go, or the child's exit
        // would never read as EOF.
        pipe.close_write();
        StreamContext {
            pipe,
            buffer: [0; READ_BUFFER_SIZE],
            bytes: Vec::new(),
            done: false,
        }
    }

    fn begin_read(&mut self) {
        // SAFETY: the context is pinned on the drain thread's stack for the
        // whole loop, and each read's completion is dequeued before the next
        // read is issued on the same context.
        if unsafe { self.pipe.begin_read(&mut self.buffer) }.is_err() {
            // A failed read is the end-of-stream signal, not a drain error.
            self.done = true;
        }
    }
}

impl ChildProcess {
    fn retrieve_outputs(&mut self) {
        if self.outputs.is_some() {
            return;
        }
        let outputs = match self.drain.take() {
            Some(drain) => match drain.join() {
                Ok(outputs) => outputs,
                Err(_) => {
                    error!(self.log, "output drain thread panicked");
                    Outputs::default()
                }
            },
            None => Outputs::default(),
        };
        self.outputs = Some(outputs);
    }
}

/// Drain task main: multiplexes both pipes over one completion port until
/// each reaches end of stream, accumulating everything the child wrote.
fn drain_outputs(stdout_pipe: Pipe, stderr_pipe: Pipe, log: Logger) -> Outputs {
    let mut stdout = StreamContext::new(stdout_pipe);
    let mut stderr = StreamContext::new(stderr_pipe);

    let port = match CompletionPort::new() {
        Ok(port) => port,
        Err(error) => {
            error!(log, "unable to create drain completion port"; "error" => %error);
            return Outputs::default();
        }
    };
    for stream in [&mut stdout, &mut stderr] {
        let key = stream as *mut StreamContext as usize;
        if let Err(error) = port.register(stream.pipe.read_handle(), key) {
            error!(log, "unable to register pipe with completion port"; "error" => %error);
            return Outputs::default();
        }
    }

    stdout.begin_read();
    stderr.begin_read();

    while !(stdout.done && stderr.done) {
        match port.wait(None) {
            WaitResult::Success { key, bytes, .. } => {
                // The key is the address of the stream context registered
                // above; the contexts outlive the loop.
                let stream = unsafe { &mut *(key as *mut StreamContext) };
                if bytes > 0 {
                    stream.bytes.extend_from_slice(&stream.buffer[..bytes as usize]);
                    stream.begin_read();
                } else {
                    // Zero bytes is EOF; re-issuing would only fail.
                    stream.done = true;
                }
            }
            WaitResult::Timeout => continue,
            WaitResult::Stopped => break,
            WaitResult::Failure(error) => {
                warn!(log, "unable to dequeue pipe completion"; "error" => %error);
                break;
            }
        }
    }

    Outputs {
        stdout: stdout.bytes,
        stderr: stderr.bytes,
    }
}

/*  _            _
 * | |_ ___  ___| |_ ___
 * | __/ _ \/ __| __/ __|
 * | ||  __/\__ \ |_\__ \
 *  \__\___||___/\__|___/
 *  FIGLET: tests
 */

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;
    use std::env;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn cmd_exe() -> PathBuf {
        env::var_os("COMSPEC")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows\System32\cmd.exe"))
    }

    /// Runs `cmd.exe` with the given arguments, waiting up to `timeout` and
    /// escalating to termination, the way the orchestrator does.
    fn run_and_collect(arguments: &[&str], timeout: Duration) -> (Option<i32>, bool, Outputs) {
        let mut job = Job::new(test_logger()).unwrap();
        let mut child = ChildProcess::new(cmd_exe(), test_logger());
        child.set_arguments(arguments.iter().copied());
        child.run(&mut job, None).unwrap();

        let mut timed_out = false;
        let mut exit_code = child.wait(Some(timeout));
        if exit_code.is_none() {
            timed_out = child.is_alive();
            exit_code = child.terminate();
        }
        let outputs = child.outputs().clone();
        (exit_code, timed_out, outputs)
    }

    #[test]
    fn render_joins_arguments_without_quoting() {
        let mut child = ChildProcess::new("app.exe", test_logger());
        child.set_arguments(["one", "two three"]);
        assert_eq!(child.render_command_line(), OsString::from("app.exe one two three"));
    }

    #[test]
    fn fast_success() {
        let (exit_code, timed_out, outputs) =
            run_and_collect(&["/C", "echo ok"], Duration::from_secs(5));
        assert_eq!(exit_code, Some(0));
        assert!(!timed_out);
        assert_eq!(outputs.stdout, b"ok\r\n");
        assert_eq!(outputs.stderr, b"");
    }

    #[test]
    fn exit_code_is_propagated() {
        let (exit_code, timed_out, outputs) =
            run_and_collect(&["/C", "exit 7"], Duration::from_secs(5));
        assert_eq!(exit_code, Some(7));
        assert!(!timed_out);
        assert_eq!(outputs, Outputs::default());
    }

    #[test]
    fn zero_output_child_leaves_both_streams_empty() {
        let (exit_code, _, outputs) = run_and_collect(&["/C", "exit 0"], Duration::from_secs(5));
        assert_eq!(exit_code, Some(0));
        assert_eq!(outputs.stdout, b"");
        assert_eq!(outputs.stderr, b"");
    }

    #[test]
    fn both_streams_are_captured() {
        let (exit_code, _, outputs) =
            run_and_collect(&["/C", "echo out& echo err 1>&2"], Duration::from_secs(5));
        assert_eq!(exit_code, Some(0));
        assert_eq!(outputs.stdout, b"out\r\n");
        // cmd keeps the space before the redirection operator.
        assert_eq!(outputs.stderr, b"err \r\n");
    }

    #[test]
    fn output_larger_than_one_buffer_is_fully_captured() {
        // 5000 lines of 16 characters plus \r\n: well past READ_BUFFER_SIZE.
        let (exit_code, _, outputs) = run_and_collect(
            &["/C", "for /L %i in (1,1,5000) do @echo xxxxxxxxxxxxxxxx"],
            Duration::from_secs(60),
        );
        assert_eq!(exit_code, Some(0));
        assert_eq!(outputs.stdout.len(), 5000 * 18);
        assert_eq!(outputs.stderr, b"");
    }

    #[test]
    fn slow_child_times_out_and_is_terminated() {
        let (exit_code, timed_out, _) = run_and_collect(
            &["/C", "ping -n 3 127.0.0.1 >nul"],
            Duration::from_millis(100),
        );
        assert!(timed_out);
        assert_eq!(exit_code, Some(KILL_EXIT_CODE as i32));
    }

    #[test]
    fn spawn_failure_reports_an_error_and_empty_outputs() {
        let mut job = Job::new(test_logger()).unwrap();
        let mut child =
            ChildProcess::new(r"C:\kiln-does-not-exist\nothing.exe", test_logger());
        assert!(child.run(&mut job, None).is_err());
        assert!(!child.is_alive());
        assert_eq!(*child.outputs(), Outputs::default());
    }
}
