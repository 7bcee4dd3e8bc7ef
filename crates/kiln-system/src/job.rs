//! Job objects: kernel containers that bound the child's CPU time and
//! memory and publish lifecycle notifications through a completion port.
//!
//! Each job owns one listener thread that drains its port. The thread is
//! joinable and stop-signalable: destruction sets a stop flag and posts a
//! synthetic stop completion, so teardown is deterministic.

use crate::{
    handle::ScopedHandle,
    iocp::{CompletionPort, WaitResult},
};
use anyhow::{Context as _, Result};
use slog::{debug, error, info, warn, Logger};
use std::{
    ffi::c_void,
    io, mem, ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use windows_sys::Win32::{
    Foundation::HANDLE,
    System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
        JobObjectExtendedLimitInformation, JobObjectLimitViolationInformation,
        QueryInformationJobObject, SetInformationJobObject, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOBOBJECT_LIMIT_VIOLATION_INFORMATION,
        JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_JOB_TIME, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
        JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS, JOB_OBJECT_MSG_ACTIVE_PROCESS_LIMIT,
        JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO, JOB_OBJECT_MSG_END_OF_JOB_TIME,
        JOB_OBJECT_MSG_END_OF_PROCESS_TIME, JOB_OBJECT_MSG_EXIT_PROCESS,
        JOB_OBJECT_MSG_JOB_MEMORY_LIMIT, JOB_OBJECT_MSG_NEW_PROCESS,
        JOB_OBJECT_MSG_NOTIFICATION_LIMIT,
    },
};

/// Completion key under which the kernel posts job notifications.
const JOB_NOTIFICATION_KEY: usize = 0xbad;

/// A lifecycle notification decoded from one completion packet. The process
/// id is zero when the kernel did not deliver one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEvent {
    NewProcess(u32),
    ExitProcess(u32),
    AbnormalExit(u32),
    ActiveLimitReached,
    ActiveZero,
    EndOfJobTime,
    EndOfProcessTime(u32),
    JobMemoryLimit,
    LimitNotification(u32),
}

impl JobEvent {
    fn decode(message: u32, process_id: u32) -> Option<JobEvent> {
        match message {
            JOB_OBJECT_MSG_NEW_PROCESS => Some(JobEvent::NewProcess(process_id)),
            JOB_OBJECT_MSG_EXIT_PROCESS => Some(JobEvent::ExitProcess(process_id)),
            JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS => Some(JobEvent::AbnormalExit(process_id)),
            JOB_OBJECT_MSG_ACTIVE_PROCESS_LIMIT => Some(JobEvent::ActiveLimitReached),
            JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO => Some(JobEvent::ActiveZero),
            JOB_OBJECT_MSG_END_OF_JOB_TIME => Some(JobEvent::EndOfJobTime),
            JOB_OBJECT_MSG_END_OF_PROCESS_TIME => Some(JobEvent::EndOfProcessTime(process_id)),
            JOB_OBJECT_MSG_JOB_MEMORY_LIMIT => Some(JobEvent::JobMemoryLimit),
            JOB_OBJECT_MSG_NOTIFICATION_LIMIT => Some(JobEvent::LimitNotification(process_id)),
            _ => None,
        }
    }
}

/// Callbacks for job lifecycle events, all default no-ops. Dispatch happens
/// on the job's listener thread under the observers lock; observers must not
/// call back into the job.
pub trait Observer {
    fn on_new_process(&self, _process_id: u32) {}
    fn on_exit_process(&self, _process_id: u32) {}
    fn on_abnormal_exit_process(&self, _process_id: u32) {}
    fn on_active_process_limit(&self) {}
    fn on_active_process_zero(&self) {}
    fn on_end_of_job_time(&self) {}
    fn on_end_of_process_time(&self, _process_id: u32) {}
    fn on_job_memory_limit(&self) {}
    fn on_limit_notification(&self, _process_id: u32) {}

    fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::NewProcess(process_id) => self.on_new_process(process_id),
            JobEvent::ExitProcess(process_id) => self.on_exit_process(process_id),
            JobEvent::AbnormalExit(process_id) => self.on_abnormal_exit_process(process_id),
            JobEvent::ActiveLimitReached => self.on_active_process_limit(),
            JobEvent::ActiveZero => self.on_active_process_zero(),
            JobEvent::EndOfJobTime => self.on_end_of_job_time(),
            JobEvent::EndOfProcessTime(process_id) => self.on_end_of_process_time(process_id),
            JobEvent::JobMemoryLimit => self.on_job_memory_limit(),
            JobEvent::LimitNotification(process_id) => self.on_limit_notification(process_id),
        }
    }
}

type ObserverList = Mutex<Vec<Arc<dyn Observer + Send + Sync>>>;

/// The three limits enforced on the job. Construct with maxima for
/// "unlimited": the conversion saturates.
#[derive(Clone, Copy, Debug)]
pub struct BasicLimits {
    pub cpu_time: Duration,
    pub overall_memory: u64,
    pub per_process_memory: u64,
}

impl Default for BasicLimits {
    fn default() -> Self {
        BasicLimits {
            cpu_time: Duration::MAX,
            overall_memory: u64::MAX,
            per_process_memory: u64::MAX,
        }
    }
}

/// Manages an unnamed job object.
pub struct Job {
    handle: ScopedHandle,
    iocp: Arc<CompletionPort>,
    // Guards against the port holding a backlog of notifications that would
    // keep the listener dequeuing past its stop signal.
    stop: Arc<AtomicBool>,
    observers: Arc<ObserverList>,
    listener: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl Job {
    pub fn new(log: Logger) -> Result<Self> {
        let raw = unsafe { CreateJobObjectW(ptr::null(), ptr::null()) };
        if raw.is_null() {
            return Err(io::Error::last_os_error()).context("creating job object");
        }
        let iocp = Arc::new(CompletionPort::new().context("creating job completion port")?);
        Ok(Job {
            handle: ScopedHandle::new(raw),
            iocp,
            stop: Arc::new(AtomicBool::new(false)),
            observers: Arc::new(Mutex::new(Vec::new())),
            listener: None,
            log,
        })
    }

    /// Applies the CPU user-time and memory limits, all three at once. On
    /// failure the job stays usable, just unlimited.
    pub fn set_basic_limits(&self, limits: &BasicLimits) -> Result<()> {
        let mut information: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        information.JobMemoryLimit = usize::try_from(limits.overall_memory).unwrap_or(usize::MAX);
        information.ProcessMemoryLimit =
            usize::try_from(limits.per_process_memory).unwrap_or(usize::MAX);
        information.BasicLimitInformation.PerJobUserTimeLimit = cpu_time_ticks(limits.cpu_time);
        information.BasicLimitInformation.LimitFlags =
            JOB_OBJECT_LIMIT_JOB_TIME | JOB_OBJECT_LIMIT_JOB_MEMORY | JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        let applied = unsafe {
            SetInformationJobObject(
                self.handle.get(),
                JobObjectExtendedLimitInformation,
                (&information as *const JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast(),
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if applied == 0 {
            return Err(io::Error::last_os_error()).context("setting job limits");
        }
        Ok(())
    }

    /// Observers are shared, not owned; dispatch holds the observers lock.
    pub fn add_observer(&self, observer: Arc<dyn Observer + Send + Sync>) {
        let mut observers = self.observers.lock().unwrap();
        if !observers.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            observers.push(observer);
        }
    }

    /// Places `process` in the job. The first successful call starts the
    /// listener thread and routes the job's notifications to its port.
    pub fn assign_process(&mut self, process: HANDLE) -> Result<()> {
        let assigned = unsafe { AssignProcessToJobObject(self.handle.get(), process) };
        if assigned == 0 {
            return Err(io::Error::last_os_error()).context("assigning process to job object");
        }

        if self.listener.is_none() {
            let iocp = self.iocp.clone();
            let stop = self.stop.clone();
            let observers = self.observers.clone();
            let job_handle = ListenerJobHandle(self.handle.get());
            let log = self.log.clone();
            self.listener = Some(
                thread::Builder::new()
                    .name("job-events".into())
                    .spawn(move || listen_for_notifications(iocp, stop, observers, job_handle, log))
                    .context("spawning job listener thread")?,
            );
            self.associate_completion_port()?;
        }
        Ok(())
    }

    fn associate_completion_port(&self) -> Result<()> {
        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: JOB_NOTIFICATION_KEY as *mut c_void,
            CompletionPort: self.iocp.handle(),
        };
        let associated = unsafe {
            SetInformationJobObject(
                self.handle.get(),
                JobObjectAssociateCompletionPortInformation,
                (&association as *const JOBOBJECT_ASSOCIATE_COMPLETION_PORT).cast(),
                mem::size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
            )
        };
        if associated == 0 {
            return Err(io::Error::last_os_error())
                .context("associating job object with completion port");
        }
        Ok(())
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(error) = self.iocp.stop() {
            warn!(self.log, "unable to post stop to job completion port"; "error" => %error);
        }
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                error!(self.log, "job listener thread panicked");
            }
        }
    }
}

/// The job handle loaned to the listener. The listener is joined before the
/// job releases its handle, so the raw value stays live for the whole
/// thread.
struct ListenerJobHandle(HANDLE);

unsafe impl Send for ListenerJobHandle {}

fn listen_for_notifications(
    iocp: Arc<CompletionPort>,
    stop: Arc<AtomicBool>,
    observers: Arc<ObserverList>,
    job: ListenerJobHandle,
    log: Logger,
) {
    while !stop.load(Ordering::Relaxed) {
        match iocp.wait(Some(Duration::from_secs(1))) {
            WaitResult::Timeout => continue,
            WaitResult::Stopped => return,
            WaitResult::Failure(error) => {
                error!(log, "unable to dequeue job notification"; "error" => %error);
                return;
            }
            WaitResult::Success {
                key,
                overlapped,
                bytes,
            } => {
                debug_assert_eq!(key, JOB_NOTIFICATION_KEY, "unexpected completion key");
                // The kernel smuggles the process id through the overlapped
                // pointer slot; it is an integer here, never a pointer.
                let process_id = overlapped as usize as u32;
                match JobEvent::decode(bytes, process_id) {
                    Some(event) => {
                        if let JobEvent::LimitNotification(_) = event {
                            log_limit_violation(&job, &log);
                        }
                        notify_observers(&observers, event);
                    }
                    None => debug!(log, "ignoring unknown job message"; "message" => bytes),
                }
            }
        }
    }
}

fn notify_observers(observers: &ObserverList, event: JobEvent) {
    let observers = observers.lock().unwrap();
    for observer in observers.iter() {
        observer.handle_event(event);
    }
}

fn log_limit_violation(job: &ListenerJobHandle, log: &Logger) {
    let mut violation: JOBOBJECT_LIMIT_VIOLATION_INFORMATION = unsafe { mem::zeroed() };
    let queried = unsafe {
        QueryInformationJobObject(
            job.0,
            JobObjectLimitViolationInformation,
            (&mut violation as *mut JOBOBJECT_LIMIT_VIOLATION_INFORMATION).cast(),
            mem::size_of::<JOBOBJECT_LIMIT_VIOLATION_INFORMATION>() as u32,
            ptr::null_mut(),
        )
    };
    if queried == 0 {
        warn!(log, "unable to query job limit violation";
            "error" => %io::Error::last_os_error());
        return;
    }
    if violation.ViolationLimitFlags & JOB_OBJECT_LIMIT_JOB_MEMORY != 0 {
        info!(log, "job reached its memory limit"; "bytes_used" => violation.JobMemory);
    }
    if violation.ViolationLimitFlags & JOB_OBJECT_LIMIT_JOB_TIME != 0 {
        info!(log, "job reached its user-mode cpu time limit";
            "ticks_used" => violation.PerJobUserTime);
    }
}

// User-time limits are expressed in 100ns ticks.
fn cpu_time_ticks(cpu_time: Duration) -> i64 {
    i64::try_from(cpu_time.as_millis())
        .unwrap_or(i64::MAX)
        .saturating_mul(10_000)
}
