//! CPython entry points the agent needs that are either version-gated or
//! typed differently from what `pyo3::ffi` exposes. Frames are passed as
//! plain object pointers; their shape comes from the overlays.

use pyo3::ffi::{PyObject, PyTypeObject};
use std::ffi::c_int;

#[repr(C)]
pub struct PyInterpreterState {
    _private: [u8; 0],
}

#[repr(C)]
pub struct PyThreadState {
    _private: [u8; 0],
}

/// `Py_tracefunc`.
pub type TraceFunc = unsafe extern "C" fn(
    obj: *mut PyObject,
    frame: *mut PyObject,
    what: c_int,
    arg: *mut PyObject,
) -> c_int;

pub const PY_TRACE_CALL: c_int = 0;
pub const PY_TRACE_EXCEPTION: c_int = 1;
pub const PY_TRACE_LINE: c_int = 2;
pub const PY_TRACE_RETURN: c_int = 3;

unsafe extern "C" {
    pub fn PyEval_SetTrace(func: Option<TraceFunc>, obj: *mut PyObject);

    pub fn PyFrame_GetLineNumber(frame: *mut PyObject) -> c_int;
    #[cfg(Py_3_9)]
    pub fn PyFrame_GetBack(frame: *mut PyObject) -> *mut PyObject;
    #[cfg(Py_3_9)]
    pub fn PyFrame_GetCode(frame: *mut PyObject) -> *mut PyObject;

    pub fn PyInterpreterState_Head() -> *mut PyInterpreterState;
    pub fn PyInterpreterState_Next(interp: *mut PyInterpreterState) -> *mut PyInterpreterState;
    pub fn PyInterpreterState_ThreadHead(interp: *mut PyInterpreterState) -> *mut PyThreadState;
    pub fn PyThreadState_Next(tstate: *mut PyThreadState) -> *mut PyThreadState;
    pub fn PyThreadState_Swap(tstate: *mut PyThreadState) -> *mut PyThreadState;

    pub static PyCell_Type: PyTypeObject;
}

/// `PyCell_Check`, which pyo3 does not expose for every version.
///
/// # Safety
/// `obj` must be a live object and the GIL must be held.
pub unsafe fn is_cell(obj: *mut PyObject) -> bool {
    unsafe { !obj.is_null() && pyo3::ffi::Py_TYPE(obj) == (&raw const PyCell_Type).cast_mut() }
}
