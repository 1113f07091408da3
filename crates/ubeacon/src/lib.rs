//! In-process agent for a time-travel debugger attached to a CPython
//! program.
//!
//! Once started, every Python thread reports its position into a single
//! [`TraceState`] and calls one of the [`hooks`] markers per event. The
//! debugger reads the state at a fixed address (`ubeacon_state`) and calls
//! the `ubeacon_interact_*` functions to pull richer snapshots into files.

pub mod attach;
pub mod config;
pub mod dump;
pub mod hooks;
mod logging;
pub mod state;
pub mod watch;

use attach::{AttachError, AttachReport, Tracer};
use config::AgentConfig;
use ctor::ctor;
use parking_lot::Mutex;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use state::TraceState;
use std::ffi::{CStr, c_char, c_int};
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, Ordering};
use ubeacon_layout::LayoutError;

static CONFIG: OnceLock<AgentConfig> = OnceLock::new();
static STATE: OnceLock<&'static TraceState> = OnceLock::new();
static AGENT: Mutex<Option<Tracer>> = Mutex::new(None);

/// Address of the live trace state, null until the first [`start`].
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static ubeacon_state: AtomicPtr<TraceState> = AtomicPtr::new(std::ptr::null_mut());

#[ctor]
fn init_agent_logging() {
    logging::init(config());
}

fn config() -> &'static AgentConfig {
    CONFIG.get_or_init(AgentConfig::from_env)
}

fn current_state() -> Option<&'static TraceState> {
    STATE.get().copied()
}

#[derive(Debug)]
pub enum AgentError {
    Layout(LayoutError),
    Attach(AttachError),
    /// Another thread is in the middle of starting or stopping.
    Busy,
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout(err) => write!(f, "{err}"),
            Self::Attach(err) => write!(f, "{err}"),
            Self::Busy => write!(f, "agent is busy starting or stopping"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<LayoutError> for AgentError {
    fn from(value: LayoutError) -> Self {
        Self::Layout(value)
    }
}

impl From<AttachError> for AgentError {
    fn from(value: AttachError) -> Self {
        Self::Attach(value)
    }
}

/// Verifies the layout catalog against the running interpreter and starts
/// tracing every thread, current and future. Starting twice is a no-op that
/// returns an empty report.
pub fn start(py: Python<'_>) -> Result<AttachReport, AgentError> {
    let mut agent = AGENT.try_lock().ok_or(AgentError::Busy)?;
    if agent.is_some() {
        return Ok(AttachReport::default());
    }

    let layout = ubeacon_layout::attach(py)?;
    let state = *STATE.get_or_init(|| Box::leak(Box::new(TraceState::new(py, layout))));
    ubeacon_state.store((state as *const TraceState).cast_mut(), Ordering::Release);

    let tracer = Tracer::new(py, state)?;
    let hook = attach::hook_future_threads(py, &tracer, config().trace_new_threads)?;
    let report = attach::trace_existing_threads(py, &tracer, &hook)?;
    for failure in report.failures() {
        if let Err(err) = &failure.outcome {
            tracing::warn!(thread_state = failure.thread_state, %err, "thread left untraced");
        }
    }
    tracing::info!(
        layout = %layout.variant,
        threads = report.attached(),
        new_threads = hook.installed(),
        "tracing started"
    );
    *agent = Some(tracer);
    Ok(report)
}

/// Stops tracing everywhere. The state stays at its address, cleared.
pub fn stop(py: Python<'_>) -> Result<(), AgentError> {
    let mut agent = AGENT.try_lock().ok_or(AgentError::Busy)?;
    if let Some(tracer) = agent.take() {
        attach::disable_tracing(py, &tracer);
        tracing::info!("tracing stopped");
    }
    Ok(())
}

#[pyfunction(name = "start")]
fn py_start(py: Python<'_>) -> PyResult<usize> {
    start(py)
        .map(|report| report.attached())
        .map_err(|err| PyRuntimeError::new_err(err.to_string()))
}

#[pyfunction(name = "stop")]
fn py_stop(py: Python<'_>) -> PyResult<()> {
    stop(py).map_err(|err| PyRuntimeError::new_err(err.to_string()))
}

#[pymodule]
fn ubeacon(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(py_start, m)?)?;
    m.add_function(wrap_pyfunction!(py_stop, m)?)?;
    Ok(())
}

/// Borrows a C path argument. Null or non-UTF-8 paths are rejected.
unsafe fn c_path<'a>(ptr: *const c_char, what: &str) -> Option<&'a Path> {
    if ptr.is_null() {
        tracing::error!(what, "null path");
        return None;
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(text) => Some(Path::new(text)),
        Err(err) => {
            tracing::error!(what, %err, "path is not UTF-8");
            None
        }
    }
}

fn status(result: Result<(), dump::DumpError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "dump failed");
            -1
        }
    }
}

/// Writes the backtrace as JSON to `path`. Returns 0, or -1 if the file could
/// not be written.
///
/// # Safety
///
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ubeacon_interact_backtrace_json(path: *const c_char) -> c_int {
    let Some(path) = (unsafe { c_path(path, "output") }) else {
        return -1;
    };
    status(dump::write_backtrace(path, current_state()))
}

/// Writes the current scope's locals as JSON to `path`.
///
/// # Safety
///
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ubeacon_interact_locals_json(path: *const c_char) -> c_int {
    let Some(path) = (unsafe { c_path(path, "output") }) else {
        return -1;
    };
    status(dump::write_locals(path, current_state()))
}

/// Evaluates `code` in the current scope and writes its repr, or the error,
/// to `path`.
///
/// # Safety
///
/// Both arguments must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ubeacon_interact_eval(path: *const c_char, code: *const c_char) -> c_int {
    let Some(path) = (unsafe { c_path(path, "output") }) else {
        return -1;
    };
    if code.is_null() {
        tracing::error!("null expression");
        return -1;
    }
    let source = unsafe { CStr::from_ptr(code) }.to_string_lossy();
    status(dump::write_eval(path, current_state(), &source))
}

/// Resolves the watch request in `request_path`, deletes it, and writes the
/// chain as JSON to `path`.
///
/// # Safety
///
/// Both arguments must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ubeacon_interact_watch_json(
    path: *const c_char,
    request_path: *const c_char,
) -> c_int {
    let Some(path) = (unsafe { c_path(path, "output") }) else {
        return -1;
    };
    let Some(request_path) = (unsafe { c_path(request_path, "request") }) else {
        return -1;
    };
    status(dump::write_watch_chain(path, current_state(), request_path))
}
