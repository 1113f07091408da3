//! Hand-maintained mirrors of CPython's private object headers.
//!
//! Every struct here copies the field order of the named CPython header for
//! the named versions. Only the fields up to the last one we read matter, but
//! they are spelled out in full so the offsets can be checked against the
//! headers line by line. All overlays are compiled regardless of the selected
//! variant so the catalog can be tested as data.

#![allow(dead_code)]

use pyo3::ffi::{Py_hash_t, Py_ssize_t, PyObject, PyVarObject};
use std::ffi::{c_char, c_int, c_void};

/// `PyTryBlock`, 3.8 to 3.10.
#[repr(C)]
pub(crate) struct TryBlock {
    b_type: c_int,
    b_handler: c_int,
    b_level: c_int,
}

/// `CO_MAXBLOCKS`.
pub(crate) const CO_MAXBLOCKS: usize = 20;

/// `struct _frame` from `Include/frameobject.h`, 3.8 and 3.9.
#[repr(C)]
pub(crate) struct FrameObject38 {
    pub ob_base: PyVarObject,
    pub f_back: *mut PyObject,
    pub f_code: *mut PyObject,
    pub f_builtins: *mut PyObject,
    pub f_globals: *mut PyObject,
    pub f_locals: *mut PyObject,
    pub f_valuestack: *mut *mut PyObject,
    pub f_stacktop: *mut *mut PyObject,
    pub f_trace: *mut PyObject,
    pub f_trace_lines: c_char,
    pub f_trace_opcodes: c_char,
    pub f_gen: *mut PyObject,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
    pub f_iblock: c_int,
    pub f_executing: c_char,
    pub f_blockstack: [TryBlock; CO_MAXBLOCKS],
    pub f_localsplus: [*mut PyObject; 1],
}

/// `struct _frame` from `Include/cpython/frameobject.h`, 3.10.
#[repr(C)]
pub(crate) struct FrameObject310 {
    pub ob_base: PyVarObject,
    pub f_back: *mut PyObject,
    pub f_code: *mut PyObject,
    pub f_builtins: *mut PyObject,
    pub f_globals: *mut PyObject,
    pub f_locals: *mut PyObject,
    pub f_valuestack: *mut *mut PyObject,
    pub f_trace: *mut PyObject,
    pub f_stackdepth: c_int,
    pub f_trace_lines: c_char,
    pub f_trace_opcodes: c_char,
    pub f_gen: *mut PyObject,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
    pub f_iblock: c_int,
    pub f_state: i8,
    pub f_blockstack: [TryBlock; CO_MAXBLOCKS],
    pub f_localsplus: [*mut PyObject; 1],
}

/// Leading fields of `struct _frame` from `Include/internal/pycore_frame.h`,
/// 3.11 onwards. The frame object only points at the interpreter frame.
#[repr(C)]
pub(crate) struct FrameObject311 {
    pub ob_base: PyObject,
    pub f_back: *mut PyObject,
    pub f_frame: *mut c_void,
}

/// `_PyInterpreterFrame`, 3.11.
#[repr(C)]
pub(crate) struct InterpreterFrame311 {
    pub f_func: *mut PyObject,
    pub f_globals: *mut PyObject,
    pub f_builtins: *mut PyObject,
    pub f_locals: *mut PyObject,
    pub f_code: *mut PyObject,
    pub frame_obj: *mut PyObject,
    pub previous: *mut c_void,
    pub prev_instr: *mut u16,
    pub stacktop: c_int,
    pub is_entry: bool,
    pub owner: c_char,
    pub localsplus: [*mut PyObject; 1],
}

/// `_PyInterpreterFrame`, 3.12.
#[repr(C)]
pub(crate) struct InterpreterFrame312 {
    pub f_code: *mut PyObject,
    pub previous: *mut c_void,
    pub f_funcobj: *mut PyObject,
    pub f_globals: *mut PyObject,
    pub f_builtins: *mut PyObject,
    pub f_locals: *mut PyObject,
    pub frame_obj: *mut PyObject,
    pub prev_instr: *mut u16,
    pub stacktop: c_int,
    pub return_offset: u16,
    pub owner: c_char,
    pub localsplus: [*mut PyObject; 1],
}

/// `_PyInterpreterFrame`, 3.13. `f_executable` is the code object for
/// Python frames.
#[repr(C)]
pub(crate) struct InterpreterFrame313 {
    pub f_executable: *mut PyObject,
    pub previous: *mut c_void,
    pub f_funcobj: *mut PyObject,
    pub f_globals: *mut PyObject,
    pub f_builtins: *mut PyObject,
    pub f_locals: *mut PyObject,
    pub frame_obj: *mut PyObject,
    pub instr_ptr: *mut u16,
    pub stacktop: c_int,
    pub return_offset: u16,
    pub owner: c_char,
    pub localsplus: [*mut PyObject; 1],
}

/// `PyDictObject`. The header kept its shape from 3.8 to 3.13; only the
/// meaning of `ma_version_tag` and the type behind `ma_values` changed.
#[repr(C)]
pub(crate) struct DictObject {
    pub ob_base: PyObject,
    pub ma_used: Py_ssize_t,
    pub ma_version_tag: u64,
    pub ma_keys: *mut c_void,
    pub ma_values: *mut c_void,
}

/// `struct _dictkeysobject` from `Objects/dict-common.h`, 3.8 to 3.10.
/// `dk_indices` follows the header.
#[repr(C)]
pub(crate) struct DictKeys38 {
    pub dk_refcnt: Py_ssize_t,
    pub dk_size: Py_ssize_t,
    pub dk_lookup: *mut c_void,
    pub dk_usable: Py_ssize_t,
    pub dk_nentries: Py_ssize_t,
}

/// `struct _dictkeysobject` from `Include/internal/pycore_dict.h`, 3.11 to
/// 3.13 (GIL builds).
#[repr(C)]
pub(crate) struct DictKeys311 {
    pub dk_refcnt: Py_ssize_t,
    pub dk_log2_size: u8,
    pub dk_log2_index_bytes: u8,
    pub dk_kind: u8,
    pub dk_version: u32,
    pub dk_usable: Py_ssize_t,
    pub dk_nentries: Py_ssize_t,
}

/// `DICT_KEYS_GENERAL`, `DICT_KEYS_UNICODE`, `DICT_KEYS_SPLIT`.
pub(crate) const DICT_KEYS_GENERAL: u8 = 0;
pub(crate) const DICT_KEYS_UNICODE: u8 = 1;
pub(crate) const DICT_KEYS_SPLIT: u8 = 2;

/// `PyDictKeyEntry`.
#[repr(C)]
pub(crate) struct GeneralEntry {
    pub me_hash: Py_hash_t,
    pub me_key: *mut PyObject,
    pub me_value: *mut PyObject,
}

/// `PyDictUnicodeEntry`, 3.11 onwards.
#[repr(C)]
pub(crate) struct UnicodeEntry {
    pub me_key: *mut PyObject,
    pub me_value: *mut PyObject,
}

/// Header of `struct _dictvalues`, 3.13. The value array follows at pointer
/// alignment.
#[repr(C)]
pub(crate) struct DictValues313 {
    pub capacity: u8,
    pub size: u8,
    pub embedded: u8,
    pub valid: u8,
    pub values: [*mut PyObject; 1],
}

/// `PyListObject`, unchanged across the supported range.
#[repr(C)]
pub(crate) struct ListObject {
    pub ob_base: PyVarObject,
    pub ob_item: *mut *mut PyObject,
    pub allocated: Py_ssize_t,
}

/// `PyCellObject`.
#[repr(C)]
pub(crate) struct CellObject {
    pub ob_base: PyObject,
    pub ob_ref: *mut PyObject,
}
