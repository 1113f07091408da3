//! Frame accessors on top of the catalog. All of them take frame objects as
//! raw pointers because the trace callback receives them that way.

use crate::ffi as cpy;
use crate::{FrameLayout, Layout};
use pyo3::ffi::PyObject;
use pyo3::prelude::*;
use std::ffi::c_int;

/// Borrowed pointer to the code object as the overlay sees it.
///
/// # Safety
/// `frame` must be a live frame object and the GIL must be held.
pub unsafe fn overlay_code(layout: &Layout, frame: *mut PyObject) -> *mut PyObject {
    unsafe {
        let base = frame.cast::<u8>();
        match layout.frame {
            FrameLayout::Inline { code_offset, .. } => {
                *base.add(code_offset).cast::<*mut PyObject>()
            }
            FrameLayout::Interpreter {
                f_frame_offset,
                code_offset,
                ..
            } => {
                let interp = *base.add(f_frame_offset).cast::<*const u8>();
                if interp.is_null() {
                    return std::ptr::null_mut();
                }
                *interp.add(code_offset).cast::<*mut PyObject>()
            }
        }
    }
}

/// Start of the fast-local array: plain locals, then cells, then free
/// variables.
///
/// # Safety
/// `frame` must be a live frame object and the GIL must be held.
pub unsafe fn locals_base(layout: &Layout, frame: *mut PyObject) -> *mut *mut PyObject {
    unsafe {
        let base = frame.cast::<u8>();
        match layout.frame {
            FrameLayout::Inline {
                localsplus_offset, ..
            } => base.add(localsplus_offset).cast::<*mut PyObject>(),
            FrameLayout::Interpreter {
                f_frame_offset,
                localsplus_offset,
                ..
            } => {
                let interp = *base.add(f_frame_offset).cast::<*mut u8>();
                if interp.is_null() {
                    return std::ptr::null_mut();
                }
                interp.add(localsplus_offset).cast::<*mut PyObject>()
            }
        }
    }
}

/// New reference to the frame's code object.
///
/// # Safety
/// `frame` must be a live frame object and the GIL must be held.
pub unsafe fn code(layout: &Layout, frame: *mut PyObject) -> *mut PyObject {
    #[cfg(Py_3_9)]
    {
        let _ = layout;
        unsafe { cpy::PyFrame_GetCode(frame) }
    }
    #[cfg(not(Py_3_9))]
    unsafe {
        let code = overlay_code(layout, frame);
        pyo3::ffi::Py_XINCREF(code);
        code
    }
}

/// New reference to the calling frame, or null at the bottom of the stack.
///
/// # Safety
/// `frame` must be a live frame object and the GIL must be held.
pub unsafe fn back(layout: &Layout, frame: *mut PyObject) -> *mut PyObject {
    #[cfg(Py_3_9)]
    {
        let _ = layout;
        unsafe { cpy::PyFrame_GetBack(frame) }
    }
    #[cfg(not(Py_3_9))]
    unsafe {
        let FrameLayout::Inline { back_offset, .. } = layout.frame else {
            return std::ptr::null_mut();
        };
        let back = *frame.cast::<u8>().add(back_offset).cast::<*mut PyObject>();
        pyo3::ffi::Py_XINCREF(back);
        back
    }
}

/// # Safety
/// `frame` must be a live frame object and the GIL must be held.
pub unsafe fn line(frame: *mut PyObject) -> c_int {
    unsafe { cpy::PyFrame_GetLineNumber(frame) }
}

/// A fast-local slot index for a variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSlot {
    Plain(usize),
    /// The slot holds a cell once the variable has been captured.
    Cell(usize),
}

impl LocalSlot {
    pub fn index(self) -> usize {
        match self {
            Self::Plain(index) | Self::Cell(index) => index,
        }
    }
}

/// Variable-name tables of a code object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeNames {
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
}

impl CodeNames {
    pub fn from_code(code: &Bound<'_, PyAny>) -> PyResult<Self> {
        Ok(Self {
            varnames: code.getattr("co_varnames")?.extract()?,
            cellvars: code.getattr("co_cellvars")?.extract()?,
            freevars: code.getattr("co_freevars")?.extract()?,
        })
    }

    pub fn slot_for(&self, frame: &FrameLayout, name: &str) -> Option<LocalSlot> {
        let nlocals = self.varnames.len();
        let is_local = |candidate: &String| self.varnames.iter().any(|v| v == candidate);

        if let Some(position) = self.cellvars.iter().position(|v| v == name) {
            if !frame.cells_share_arg_slots() {
                return Some(LocalSlot::Cell(nlocals + position));
            }
            if let Some(index) = self.varnames.iter().position(|v| v == name) {
                return Some(LocalSlot::Cell(index));
            }
            let before = self.cellvars[..position]
                .iter()
                .filter(|v| !is_local(v))
                .count();
            return Some(LocalSlot::Cell(nlocals + before));
        }

        if let Some(position) = self.freevars.iter().position(|v| v == name) {
            let cells = if frame.cells_share_arg_slots() {
                self.cellvars.iter().filter(|v| !is_local(v)).count()
            } else {
                self.cellvars.len()
            };
            return Some(LocalSlot::Cell(nlocals + cells + position));
        }

        self.varnames
            .iter()
            .position(|v| v == name)
            .map(LocalSlot::Plain)
    }
}
