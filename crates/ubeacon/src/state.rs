//! The trace state the debugger reads by address, and the dispatch that
//! keeps it current.
//!
//! Everything here runs inside the interpreter's trace callback, so it only
//! touches objects through the C API, never allocates beyond reference
//! counting, never logs, and never lets a Python error escape.

use crate::hooks;
use pyo3::ffi::{self, PyObject};
use pyo3::prelude::*;
use pyo3::types::PyString;
use std::cell::Cell;
use std::ffi::{c_char, c_int};
use ubeacon_layout::ffi::{PY_TRACE_CALL, PY_TRACE_EXCEPTION, PY_TRACE_LINE, PY_TRACE_RETURN};
use ubeacon_layout::{Layout, back, code, line};
use ubeacon_types::identity_hash;

/// A slot holding one strong reference.
#[repr(transparent)]
pub struct OwnedRef(Cell<*mut PyObject>);

impl OwnedRef {
    pub const fn empty() -> Self {
        Self(Cell::new(std::ptr::null_mut()))
    }

    pub fn get(&self) -> *mut PyObject {
        self.0.get()
    }

    pub fn is_empty(&self) -> bool {
        self.0.get().is_null()
    }

    /// Stores `new` and then releases the previous occupant, so a destructor
    /// triggered by the release already sees the new value.
    ///
    /// # Safety
    /// The GIL must be held and `new` must be null or a strong reference the
    /// slot takes over.
    pub unsafe fn replace(&self, new: *mut PyObject) {
        let old = self.0.replace(new);
        unsafe { ffi::Py_XDECREF(old) };
    }

    /// # Safety
    /// The GIL must be held.
    pub unsafe fn clear(&self) {
        unsafe { self.replace(std::ptr::null_mut()) };
    }
}

/// Process-wide execution snapshot.
///
/// The leading fields are the scalar channel: their order and widths are
/// read by the debugger and must not change.
#[repr(C)]
pub struct TraceState {
    pub current_file: Cell<*const c_char>,
    pub current_func: Cell<*const c_char>,
    pub current_file_id: Cell<u64>,
    pub current_line: Cell<u64>,
    pub current_func_id: Cell<u64>,
    pub current_frame: OwnedRef,
    pub current_depth: Cell<u64>,
    pub first_line: Cell<u64>,
    pub exception_origin: Cell<u64>,
    pub exception_info: OwnedRef,
    pub exception_type: Cell<*const c_char>,
    pub exception_type_id: Cell<u64>,

    /// Keeps the string behind `exception_type` alive.
    exception_type_name: OwnedRef,
    layout: &'static Layout,
    co_name: Py<PyString>,
    co_filename: Py<PyString>,
    tb_next: Py<PyString>,
    tb_frame: Py<PyString>,
    dunder_name: Py<PyString>,
}

// SAFETY: every mutation happens under the GIL, which serializes access.
unsafe impl Sync for TraceState {}

impl TraceState {
    pub fn new(py: Python<'_>, layout: &'static Layout) -> Self {
        Self {
            current_file: Cell::new(std::ptr::null()),
            current_func: Cell::new(std::ptr::null()),
            current_file_id: Cell::new(0),
            current_line: Cell::new(0),
            current_func_id: Cell::new(0),
            current_frame: OwnedRef::empty(),
            current_depth: Cell::new(0),
            first_line: Cell::new(0),
            exception_origin: Cell::new(0),
            exception_info: OwnedRef::empty(),
            exception_type: Cell::new(std::ptr::null()),
            exception_type_id: Cell::new(0),
            exception_type_name: OwnedRef::empty(),
            layout,
            co_name: PyString::intern(py, "co_name").unbind(),
            co_filename: PyString::intern(py, "co_filename").unbind(),
            tb_next: PyString::intern(py, "tb_next").unbind(),
            tb_frame: PyString::intern(py, "tb_frame").unbind(),
            dunder_name: PyString::intern(py, "__name__").unbind(),
        }
    }

    pub fn layout(&self) -> &'static Layout {
        self.layout
    }

    /// Applies one trace event and fires the matching marker hook.
    ///
    /// # Safety
    /// The GIL must be held, `frame` must be a live frame object, and `arg`
    /// must be what the interpreter passes for `what`.
    pub unsafe fn dispatch(&self, frame: *mut PyObject, what: c_int, arg: *mut PyObject) {
        unsafe {
            self.update_position(frame);
            self.clear_exception();
            match what {
                PY_TRACE_CALL => {
                    self.first_line.set(1);
                    hooks::ubeacon_trace_call();
                }
                PY_TRACE_LINE => {
                    self.first_line.set(0);
                    hooks::ubeacon_trace_line();
                }
                PY_TRACE_RETURN => {
                    hooks::ubeacon_trace_ret();
                    self.current_frame.clear();
                }
                PY_TRACE_EXCEPTION => {
                    self.record_exception(frame, arg);
                    hooks::ubeacon_trace_exception();
                }
                _ => {}
            }
        }
    }

    /// Drops every owned reference and zeroes the scalar channel.
    ///
    /// # Safety
    /// The GIL must be held.
    pub unsafe fn reset(&self) {
        unsafe {
            self.clear_exception();
            self.current_file.set(std::ptr::null());
            self.current_func.set(std::ptr::null());
            self.current_file_id.set(0);
            self.current_func_id.set(0);
            self.current_line.set(0);
            self.current_depth.set(0);
            self.first_line.set(0);
            self.current_frame.clear();
        }
    }

    unsafe fn update_position(&self, frame: *mut PyObject) {
        unsafe {
            let depth = self.depth(frame);
            let code = code(self.layout, frame);
            let (func, func_len) = utf8_attr(code, self.co_name.as_ptr());
            let (file, file_len) = utf8_attr(code, self.co_filename.as_ptr());
            ffi::Py_XDECREF(code);

            ffi::Py_INCREF(frame);
            self.current_frame.replace(frame);
            self.current_depth.set(depth);
            self.current_func.set(func);
            self.current_func_id.set(hash_raw(func, func_len));
            self.current_file.set(file);
            self.current_file_id.set(hash_raw(file, file_len));
            self.current_line.set(u64::try_from(line(frame)).unwrap_or(0));
        }
    }

    unsafe fn depth(&self, frame: *mut PyObject) -> u64 {
        unsafe {
            let mut depth = 1;
            let mut parent = back(self.layout, frame);
            while !parent.is_null() {
                depth += 1;
                let next = back(self.layout, parent);
                ffi::Py_DECREF(parent);
                parent = next;
            }
            depth
        }
    }

    unsafe fn clear_exception(&self) {
        unsafe {
            self.exception_origin.set(0);
            self.exception_type.set(std::ptr::null());
            self.exception_type_id.set(0);
            self.exception_type_name.clear();
            self.exception_info.clear();
        }
    }

    unsafe fn record_exception(&self, frame: *mut PyObject, exc_info: *mut PyObject) {
        unsafe {
            if exc_info.is_null()
                || ffi::PyTuple_Check(exc_info) == 0
                || ffi::PyTuple_Size(exc_info) != 3
            {
                return;
            }
            ffi::Py_INCREF(exc_info);
            self.exception_info.replace(exc_info);

            let exc_type = ffi::PyTuple_GetItem(exc_info, 0);
            let name = ffi::PyObject_GetAttr(exc_type, self.dunder_name.as_ptr());
            if name.is_null() || ffi::PyUnicode_Check(name) == 0 {
                ffi::Py_XDECREF(name);
                ffi::PyErr_Clear();
            } else {
                let mut len: ffi::Py_ssize_t = 0;
                let text = ffi::PyUnicode_AsUTF8AndSize(name, &mut len);
                if text.is_null() {
                    ffi::PyErr_Clear();
                    ffi::Py_DECREF(name);
                } else {
                    self.exception_type_name.replace(name);
                    self.exception_type.set(text);
                    self.exception_type_id.set(hash_raw(text, len));
                }
            }

            let traceback = ffi::PyTuple_GetItem(exc_info, 2);
            let origin = self.deepest_traceback_frame(traceback);
            self.exception_origin.set(u64::from(!origin.is_null() && origin == frame));
            ffi::Py_XDECREF(origin);
        }
    }

    /// New reference to the frame of the innermost traceback entry, or null.
    unsafe fn deepest_traceback_frame(&self, traceback: *mut PyObject) -> *mut PyObject {
        unsafe {
            if traceback.is_null() || traceback == ffi::Py_None() {
                return std::ptr::null_mut();
            }
            ffi::Py_INCREF(traceback);
            let mut node = traceback;
            loop {
                let next = ffi::PyObject_GetAttr(node, self.tb_next.as_ptr());
                if next.is_null() {
                    ffi::PyErr_Clear();
                    break;
                }
                if next == ffi::Py_None() {
                    ffi::Py_DECREF(next);
                    break;
                }
                ffi::Py_DECREF(node);
                node = next;
            }
            let frame = ffi::PyObject_GetAttr(node, self.tb_frame.as_ptr());
            ffi::Py_DECREF(node);
            if frame.is_null() {
                ffi::PyErr_Clear();
                return std::ptr::null_mut();
            }
            if frame == ffi::Py_None() {
                ffi::Py_DECREF(frame);
                return std::ptr::null_mut();
            }
            frame
        }
    }
}

/// UTF-8 view of a string attribute. The pointer is borrowed from the
/// attribute's value, which `owner` keeps alive.
unsafe fn utf8_attr(owner: *mut PyObject, name: *mut PyObject) -> (*const c_char, ffi::Py_ssize_t) {
    unsafe {
        if owner.is_null() {
            return (std::ptr::null(), 0);
        }
        let value = ffi::PyObject_GetAttr(owner, name);
        if value.is_null() {
            ffi::PyErr_Clear();
            return (std::ptr::null(), 0);
        }
        let mut len: ffi::Py_ssize_t = 0;
        let text = if ffi::PyUnicode_Check(value) != 0 {
            ffi::PyUnicode_AsUTF8AndSize(value, &mut len)
        } else {
            std::ptr::null()
        };
        if text.is_null() {
            ffi::PyErr_Clear();
            len = 0;
        }
        ffi::Py_DECREF(value);
        (text, len)
    }
}

unsafe fn hash_raw(text: *const c_char, len: ffi::Py_ssize_t) -> u64 {
    let Ok(len) = usize::try_from(len) else {
        return 0;
    };
    if text.is_null() {
        return 0;
    }
    let bytes = unsafe { std::slice::from_raw_parts(text.cast::<u8>(), len) };
    std::str::from_utf8(bytes).map_or(0, identity_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyDict;
    use std::ffi::CStr;

    fn c_str(ptr: *const c_char) -> Option<String> {
        (!ptr.is_null()).then(|| {
            unsafe { CStr::from_ptr(ptr) }
                .to_string_lossy()
                .into_owned()
        })
    }

    fn state(py: Python<'_>) -> &'static TraceState {
        Box::leak(Box::new(TraceState::new(py, ubeacon_layout::compiled())))
    }

    fn run<'py>(py: Python<'py>, source: &CStr) -> Bound<'py, PyDict> {
        let ns = PyDict::new(py);
        py.run(source, Some(&ns), Some(&ns)).expect("test code should run");
        ns
    }

    #[test]
    fn owned_ref_releases_previous_after_install() {
        Python::attach(|py| {
            let first = py.eval(c"object()", None, None).expect("object");
            let second = py.eval(c"object()", None, None).expect("object");
            let slot = OwnedRef::empty();
            let before = first.get_refcnt();
            unsafe {
                ffi::Py_INCREF(first.as_ptr());
                slot.replace(first.as_ptr());
                assert_eq!(first.get_refcnt(), before + 1);
                ffi::Py_INCREF(second.as_ptr());
                slot.replace(second.as_ptr());
                assert_eq!(first.get_refcnt(), before);
                assert_eq!(slot.get(), second.as_ptr());
                slot.clear();
            }
            assert!(slot.is_empty());
        });
    }

    #[test]
    fn call_line_return_sequence() {
        Python::attach(|py| {
            let ns = run(
                py,
                c"import sys\ndef g():\n    return sys._getframe()\ndef f():\n    return g()\nframe = f()\n",
            );
            let frame = ns.get_item("frame").expect("get").expect("frame");
            let state = state(py);
            let outer_depth = {
                let mut depth = 0u64;
                let mut cursor = Some(frame.clone());
                while let Some(f) = cursor {
                    depth += 1;
                    let back = f.getattr("f_back").expect("f_back");
                    cursor = (!back.is_none()).then_some(back);
                }
                depth
            };

            unsafe {
                state.dispatch(frame.as_ptr(), PY_TRACE_CALL, ffi::Py_None());
                assert_eq!(state.first_line.get(), 1);
                assert_eq!(c_str(state.current_func.get()).as_deref(), Some("g"));
                assert_eq!(state.current_func_id.get(), identity_hash("g"));
                assert_eq!(state.current_file_id.get(), identity_hash("<string>"));
                assert_eq!(state.current_frame.get(), frame.as_ptr());
                assert_eq!(state.current_depth.get(), outer_depth);

                state.dispatch(frame.as_ptr(), PY_TRACE_LINE, std::ptr::null_mut());
                assert_eq!(state.first_line.get(), 0);
                assert_eq!(state.current_line.get(), 3);

                let held = frame.get_refcnt();
                state.dispatch(frame.as_ptr(), PY_TRACE_RETURN, ffi::Py_None());
                assert!(state.current_frame.is_empty());
                assert_eq!(frame.get_refcnt(), held - 1);

                state.reset();
                assert_eq!(state.current_func_id.get(), 0);
                assert!(state.current_func.get().is_null());
            }
        });
    }

    #[test]
    fn exception_origin_is_the_raising_frame() {
        Python::attach(|py| {
            let ns = run(
                py,
                c"import sys
def g():
    raise ValueError('boom')
def f():
    try:
        g()
    except ValueError:
        return sys.exc_info(), sys._getframe()
info, caller = f()
raiser = info[2].tb_next.tb_frame
",
            );
            let info = ns.get_item("info").expect("get").expect("info");
            let raiser = ns.get_item("raiser").expect("get").expect("raiser");
            let caller = ns.get_item("caller").expect("get").expect("caller");
            let state = state(py);

            unsafe {
                state.dispatch(raiser.as_ptr(), PY_TRACE_EXCEPTION, info.as_ptr());
                assert_eq!(state.exception_origin.get(), 1);
                assert_eq!(c_str(state.exception_type.get()).as_deref(), Some("ValueError"));
                assert_eq!(state.exception_type_id.get(), identity_hash("ValueError"));
                assert_eq!(state.exception_info.get(), info.as_ptr());

                state.dispatch(caller.as_ptr(), PY_TRACE_EXCEPTION, info.as_ptr());
                assert_eq!(state.exception_origin.get(), 0);
                assert_eq!(state.exception_type_id.get(), identity_hash("ValueError"));

                state.dispatch(caller.as_ptr(), PY_TRACE_LINE, std::ptr::null_mut());
                assert!(state.exception_info.is_empty());
                assert!(state.exception_type.get().is_null());
                assert_eq!(state.exception_type_id.get(), 0);
                state.reset();
            }
        });
    }

    #[test]
    fn malformed_exception_info_is_ignored() {
        Python::attach(|py| {
            let ns = run(py, c"import sys\nframe = sys._getframe()\nbogus = (1, 2)\n");
            let frame = ns.get_item("frame").expect("get").expect("frame");
            let bogus = ns.get_item("bogus").expect("get").expect("bogus");
            let state = state(py);
            unsafe {
                state.dispatch(frame.as_ptr(), PY_TRACE_EXCEPTION, bogus.as_ptr());
                assert!(state.exception_info.is_empty());
                assert_eq!(state.exception_type_id.get(), 0);
                assert!(ffi::PyErr_Occurred().is_null());
                state.reset();
            }
        });
    }

    #[test]
    fn scalar_channel_offsets_are_stable() {
        use std::mem::offset_of;
        assert_eq!(offset_of!(TraceState, current_file), 0);
        assert_eq!(offset_of!(TraceState, current_func), 8);
        assert_eq!(offset_of!(TraceState, current_file_id), 16);
        assert_eq!(offset_of!(TraceState, current_line), 24);
        assert_eq!(offset_of!(TraceState, current_func_id), 32);
        assert_eq!(offset_of!(TraceState, current_frame), 40);
        assert_eq!(offset_of!(TraceState, current_depth), 48);
        assert_eq!(offset_of!(TraceState, first_line), 56);
        assert_eq!(offset_of!(TraceState, exception_origin), 64);
        assert_eq!(offset_of!(TraceState, exception_info), 72);
        assert_eq!(offset_of!(TraceState, exception_type), 80);
        assert_eq!(offset_of!(TraceState, exception_type_id), 88);
    }
}
