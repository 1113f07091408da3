//! Wires the trace callback into every interpreter thread.
//!
//! New threads must be covered before existing ones: once the existing
//! threads are traced, the `threading.settrace` call that covers new threads
//! would itself be traced. [`trace_existing_threads`] therefore takes the
//! [`FutureThreadHook`] that only [`hook_future_threads`] hands out.

use crate::state::TraceState;
use pyo3::ffi::{self, PyObject};
use pyo3::prelude::*;
use std::error::Error;
use std::ffi::{CStr, c_int, c_void};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use ubeacon_layout::ffi as cpy;
use ubeacon_layout::ffi::PY_TRACE_CALL;

const CAPSULE_NAME: &CStr = c"ubeacon.trace_state";

const PHASE_IDLE: u8 = 0;
const PHASE_FUTURE_HOOKED: u8 = 1;
const PHASE_TRACING: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// `threading.settrace` could not be called.
    FutureThreadHook(String),
    /// The interpreter refused the trace function for one thread, usually
    /// because an audit hook vetoed `sys.settrace`.
    SetTrace(String),
    OutOfOrder {
        expected: &'static str,
    },
    Capsule(String),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FutureThreadHook(message) => {
                write!(f, "could not register the new-thread trace hook: {message}")
            }
            Self::SetTrace(message) => write!(f, "could not install the trace function: {message}"),
            Self::OutOfOrder { expected } => {
                write!(f, "thread attachment out of order: expected {expected} first")
            }
            Self::Capsule(message) => write!(f, "could not wrap the trace state: {message}"),
        }
    }
}

impl Error for AttachError {}

/// The native trace function. The state arrives through the capsule passed
/// as the trace object.
unsafe extern "C" fn trace_entry(
    obj: *mut PyObject,
    frame: *mut PyObject,
    what: c_int,
    arg: *mut PyObject,
) -> c_int {
    unsafe {
        let state = ffi::PyCapsule_GetPointer(obj, CAPSULE_NAME.as_ptr()).cast::<TraceState>();
        if state.is_null() {
            ffi::PyErr_Clear();
            return 0;
        }
        (*state).dispatch(frame, what, arg);
    }
    0
}

/// A trace state bound to the capsule the interpreter hands back to
/// [`trace_entry`].
pub struct Tracer {
    state: &'static TraceState,
    capsule: Py<PyAny>,
    phase: AtomicU8,
}

impl Tracer {
    pub fn new(py: Python<'_>, state: &'static TraceState) -> Result<Self, AttachError> {
        let pointer = (state as *const TraceState).cast_mut().cast::<c_void>();
        // SAFETY: the state is 'static, so the capsule can never outlive it.
        let capsule = unsafe {
            let raw = ffi::PyCapsule_New(pointer, CAPSULE_NAME.as_ptr(), None);
            Bound::from_owned_ptr_or_err(py, raw)
                .map_err(|err| AttachError::Capsule(err.to_string()))?
        };
        Ok(Self {
            state,
            capsule: capsule.unbind(),
            phase: AtomicU8::new(PHASE_IDLE),
        })
    }

    pub fn state(&self) -> &'static TraceState {
        self.state
    }

    /// Installs the trace function on the calling thread only.
    pub fn trace_current_thread(&self, py: Python<'_>) -> Result<(), AttachError> {
        unsafe { cpy::PyEval_SetTrace(Some(trace_entry), self.capsule.as_ptr()) };
        match PyErr::take(py) {
            Some(err) => Err(AttachError::SetTrace(err.to_string())),
            None => Ok(()),
        }
    }
}

/// Installed as `threading.settrace`'s hook: the first event of a new thread
/// switches that thread over to the native trace function.
#[pyclass(module = "ubeacon", frozen)]
struct ThreadHook {
    capsule: Py<PyAny>,
    state: &'static TraceState,
}

#[pymethods]
impl ThreadHook {
    fn __call__(
        &self,
        py: Python<'_>,
        frame: &Bound<'_, PyAny>,
        event: &str,
        arg: &Bound<'_, PyAny>,
    ) -> PyResult<Py<PyAny>> {
        unsafe { cpy::PyEval_SetTrace(Some(trace_entry), self.capsule.as_ptr()) };
        if let Some(err) = PyErr::take(py) {
            return Err(err);
        }
        // The event that brought us here never reaches the native function.
        if event == "call" {
            unsafe { self.state.dispatch(frame.as_ptr(), PY_TRACE_CALL, arg.as_ptr()) };
        }
        Ok(py.None())
    }
}

/// Proof that new threads are covered.
#[derive(Debug)]
pub struct FutureThreadHook {
    installed: bool,
}

impl FutureThreadHook {
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Step one of attachment. With `enabled` false the hook is skipped but the
/// token is still issued, so single-threaded setups keep the same ordering.
pub fn hook_future_threads(
    py: Python<'_>,
    tracer: &Tracer,
    enabled: bool,
) -> Result<FutureThreadHook, AttachError> {
    tracer
        .phase
        .compare_exchange(PHASE_IDLE, PHASE_FUTURE_HOOKED, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| AttachError::OutOfOrder {
            expected: "a tracer that is not yet attached",
        })?;

    if !enabled {
        tracing::info!("new-thread trace hook disabled by configuration");
        return Ok(FutureThreadHook { installed: false });
    }

    let hook = ThreadHook {
        capsule: tracer.capsule.clone_ref(py),
        state: tracer.state,
    };
    let result = (|| -> PyResult<()> {
        let hook = Bound::new(py, hook)?;
        py.import("threading")?.call_method1("settrace", (hook,))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            tracing::debug!("new-thread trace hook registered");
            Ok(FutureThreadHook { installed: true })
        }
        Err(err) => {
            tracer.phase.store(PHASE_IDLE, Ordering::Release);
            Err(AttachError::FutureThreadHook(err.to_string()))
        }
    }
}

/// Outcome for one thread state.
#[derive(Debug)]
pub struct ThreadAttach {
    pub interpreter: usize,
    pub thread_state: usize,
    pub outcome: Result<(), AttachError>,
}

#[derive(Debug, Default)]
pub struct AttachReport {
    pub threads: Vec<ThreadAttach>,
}

impl AttachReport {
    pub fn attached(&self) -> usize {
        self.threads.iter().filter(|t| t.outcome.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThreadAttach> {
        self.threads.iter().filter(|t| t.outcome.is_err())
    }
}

/// Step two of attachment: installs the trace function on every thread of
/// every interpreter, one thread at a time.
pub fn trace_existing_threads(
    py: Python<'_>,
    tracer: &Tracer,
    _hook: &FutureThreadHook,
) -> Result<AttachReport, AttachError> {
    tracer
        .phase
        .compare_exchange(
            PHASE_FUTURE_HOOKED,
            PHASE_TRACING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| AttachError::OutOfOrder {
            expected: "hook_future_threads",
        })?;

    let mut report = AttachReport::default();
    for_each_thread(|interp, tstate| {
        let outcome = with_thread_state(tstate, || tracer.trace_current_thread(py));
        report.threads.push(ThreadAttach {
            interpreter: interp as usize,
            thread_state: tstate as usize,
            outcome,
        });
    });
    Ok(report)
}

/// Removes the trace function everywhere, drops the new-thread hook, and
/// releases what the state holds.
pub fn disable_tracing(py: Python<'_>, tracer: &Tracer) {
    if let Err(err) = py
        .import("threading")
        .and_then(|threading| threading.call_method1("settrace", (py.None(),)))
    {
        tracing::warn!(%err, "could not clear the new-thread trace hook");
    }
    for_each_thread(|_, tstate| {
        with_thread_state(tstate, || {
            unsafe { cpy::PyEval_SetTrace(None, std::ptr::null_mut()) };
            if let Some(err) = PyErr::take(py) {
                tracing::warn!(%err, thread_state = tstate as usize, "could not remove trace function");
            }
        });
    });
    unsafe { tracer.state.reset() };
    tracer.phase.store(PHASE_IDLE, Ordering::Release);
}

fn for_each_thread(mut visit: impl FnMut(*mut cpy::PyInterpreterState, *mut cpy::PyThreadState)) {
    unsafe {
        let mut interp = cpy::PyInterpreterState_Head();
        while !interp.is_null() {
            let mut tstate = cpy::PyInterpreterState_ThreadHead(interp);
            while !tstate.is_null() {
                visit(interp, tstate);
                tstate = cpy::PyThreadState_Next(tstate);
            }
            interp = cpy::PyInterpreterState_Next(interp);
        }
    }
}

/// Runs `f` as if on `tstate`. Errors raised inside stay on that thread
/// state, so `f` must take them before returning.
fn with_thread_state<T>(tstate: *mut cpy::PyThreadState, f: impl FnOnce() -> T) -> T {
    unsafe {
        let previous = cpy::PyThreadState_Swap(tstate);
        let result = f();
        cpy::PyThreadState_Swap(previous);
        result
    }
}
