//! Per-version layout catalog for the CPython objects the agent reads
//! without going through the C API: dict key tables, frame fast-local
//! arrays, list item arrays, and cells.
//!
//! Exactly one [`LayoutVariant`] is compiled in, chosen by `build.rs` from the
//! interpreter pyo3 builds against. [`attach`] refuses an interpreter that
//! does not match it.

use pyo3::Python;
use std::error::Error;
use std::fmt;
use std::mem::{offset_of, size_of};

pub mod ffi;

mod check;
mod dict;
mod frame;
mod overlay;

pub use dict::{ProbeKey, locate, locate_raw};
pub use frame::{CodeNames, LocalSlot, back, code, line, locals_base};

use overlay::{
    CellObject, DictKeys38, DictKeys311, DictObject, DictValues313, FrameObject38,
    FrameObject310, FrameObject311, InterpreterFrame311, InterpreterFrame312,
    InterpreterFrame313, ListObject,
};

#[cfg(Py_GIL_DISABLED)]
compile_error!("free-threaded CPython builds use a different dict layout and are not supported");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutVariant {
    /// 3.8 and 3.9.
    Py38,
    Py310,
    Py311,
    Py312,
    Py313,
}

impl LayoutVariant {
    pub const ALL: [Self; 5] = [Self::Py38, Self::Py310, Self::Py311, Self::Py312, Self::Py313];

    pub fn for_version(major: u8, minor: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| major == 3 && variant.minors().contains(&minor))
    }

    /// Python 3 minor versions this variant describes.
    pub fn minors(self) -> std::ops::RangeInclusive<u8> {
        match self {
            Self::Py38 => 8..=9,
            Self::Py310 => 10..=10,
            Self::Py311 => 11..=11,
            Self::Py312 => 12..=12,
            Self::Py313 => 13..=13,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Py38 => "py38",
            Self::Py310 => "py310",
            Self::Py311 => "py311",
            Self::Py312 => "py312",
            Self::Py313 => "py313",
        }
    }

    pub fn layout(self) -> &'static Layout {
        match self {
            Self::Py38 => &PY38,
            Self::Py310 => &PY310,
            Self::Py311 => &PY311,
            Self::Py312 => &PY312,
            Self::Py313 => &PY313,
        }
    }
}

impl fmt::Display for LayoutVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minors = self.minors();
        if minors.start() == minors.end() {
            write!(f, "{} (3.{})", self.as_str(), minors.start())
        } else {
            write!(f, "{} (3.{}-3.{})", self.as_str(), minors.start(), minors.end())
        }
    }
}

#[cfg(ubeacon_layout = "py38")]
pub const COMPILED: LayoutVariant = LayoutVariant::Py38;
#[cfg(ubeacon_layout = "py310")]
pub const COMPILED: LayoutVariant = LayoutVariant::Py310;
#[cfg(ubeacon_layout = "py311")]
pub const COMPILED: LayoutVariant = LayoutVariant::Py311;
#[cfg(ubeacon_layout = "py312")]
pub const COMPILED: LayoutVariant = LayoutVariant::Py312;
#[cfg(ubeacon_layout = "py313")]
pub const COMPILED: LayoutVariant = LayoutVariant::Py313;

/// Dict key-table header, which changed shape in 3.11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysHeader {
    /// `dk_size` holds the table size; index width follows from it. Every
    /// entry is a `PyDictKeyEntry`.
    Sized {
        size_offset: usize,
        nentries_offset: usize,
        indices_offset: usize,
    },
    /// Sizes are stored as log2 bytes and `dk_kind` picks the entry type.
    Log2 {
        log2_size_offset: usize,
        log2_index_bytes_offset: usize,
        kind_offset: usize,
        nentries_offset: usize,
        indices_offset: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLayout {
    pub stride: usize,
    pub key_offset: usize,
    pub value_offset: usize,
}

pub const GENERAL_ENTRY: EntryLayout = EntryLayout {
    stride: size_of::<overlay::GeneralEntry>(),
    key_offset: offset_of!(overlay::GeneralEntry, me_key),
    value_offset: offset_of!(overlay::GeneralEntry, me_value),
};

pub const UNICODE_ENTRY: EntryLayout = EntryLayout {
    stride: size_of::<overlay::UnicodeEntry>(),
    key_offset: offset_of!(overlay::UnicodeEntry, me_key),
    value_offset: offset_of!(overlay::UnicodeEntry, me_value),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictLayout {
    pub keys_offset: usize,
    pub values_offset: usize,
    pub header: KeysHeader,
    /// Distance from `ma_values` to the first value pointer.
    pub split_values_offset: usize,
}

/// Where the fast-local array of a frame object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// `f_localsplus` is the tail of the frame object itself.
    Inline {
        back_offset: usize,
        code_offset: usize,
        localsplus_offset: usize,
    },
    /// The frame object points at a `_PyInterpreterFrame` that owns the
    /// locals. Cell-only variables sit after the plain locals and are not
    /// listed in `co_varnames`.
    Interpreter {
        f_frame_offset: usize,
        code_offset: usize,
        localsplus_offset: usize,
    },
}

impl FrameLayout {
    /// Whether cell variables that are also parameters reuse the
    /// parameter's slot.
    pub fn cells_share_arg_slots(&self) -> bool {
        matches!(self, Self::Interpreter { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub variant: LayoutVariant,
    pub dict: DictLayout,
    pub frame: FrameLayout,
    pub list_items_offset: usize,
    pub cell_ref_offset: usize,
}

const DICT_KEYS: usize = offset_of!(DictObject, ma_keys);
const DICT_VALUES: usize = offset_of!(DictObject, ma_values);

const SIZED_KEYS: KeysHeader = KeysHeader::Sized {
    size_offset: offset_of!(DictKeys38, dk_size),
    nentries_offset: offset_of!(DictKeys38, dk_nentries),
    indices_offset: size_of::<DictKeys38>(),
};

const LOG2_KEYS: KeysHeader = KeysHeader::Log2 {
    log2_size_offset: offset_of!(DictKeys311, dk_log2_size),
    log2_index_bytes_offset: offset_of!(DictKeys311, dk_log2_index_bytes),
    kind_offset: offset_of!(DictKeys311, dk_kind),
    nentries_offset: offset_of!(DictKeys311, dk_nentries),
    indices_offset: size_of::<DictKeys311>(),
};

const LIST_ITEMS: usize = offset_of!(ListObject, ob_item);
const CELL_REF: usize = offset_of!(CellObject, ob_ref);

pub static PY38: Layout = Layout {
    variant: LayoutVariant::Py38,
    dict: DictLayout {
        keys_offset: DICT_KEYS,
        values_offset: DICT_VALUES,
        header: SIZED_KEYS,
        split_values_offset: 0,
    },
    frame: FrameLayout::Inline {
        back_offset: offset_of!(FrameObject38, f_back),
        code_offset: offset_of!(FrameObject38, f_code),
        localsplus_offset: offset_of!(FrameObject38, f_localsplus),
    },
    list_items_offset: LIST_ITEMS,
    cell_ref_offset: CELL_REF,
};

pub static PY310: Layout = Layout {
    variant: LayoutVariant::Py310,
    dict: DictLayout {
        keys_offset: DICT_KEYS,
        values_offset: DICT_VALUES,
        header: SIZED_KEYS,
        split_values_offset: 0,
    },
    frame: FrameLayout::Inline {
        back_offset: offset_of!(FrameObject310, f_back),
        code_offset: offset_of!(FrameObject310, f_code),
        localsplus_offset: offset_of!(FrameObject310, f_localsplus),
    },
    list_items_offset: LIST_ITEMS,
    cell_ref_offset: CELL_REF,
};

pub static PY311: Layout = Layout {
    variant: LayoutVariant::Py311,
    dict: DictLayout {
        keys_offset: DICT_KEYS,
        values_offset: DICT_VALUES,
        header: LOG2_KEYS,
        split_values_offset: 0,
    },
    frame: FrameLayout::Interpreter {
        f_frame_offset: offset_of!(FrameObject311, f_frame),
        code_offset: offset_of!(InterpreterFrame311, f_code),
        localsplus_offset: offset_of!(InterpreterFrame311, localsplus),
    },
    list_items_offset: LIST_ITEMS,
    cell_ref_offset: CELL_REF,
};

pub static PY312: Layout = Layout {
    variant: LayoutVariant::Py312,
    dict: DictLayout {
        keys_offset: DICT_KEYS,
        values_offset: DICT_VALUES,
        header: LOG2_KEYS,
        split_values_offset: 0,
    },
    frame: FrameLayout::Interpreter {
        f_frame_offset: offset_of!(FrameObject311, f_frame),
        code_offset: offset_of!(InterpreterFrame312, f_code),
        localsplus_offset: offset_of!(InterpreterFrame312, localsplus),
    },
    list_items_offset: LIST_ITEMS,
    cell_ref_offset: CELL_REF,
};

pub static PY313: Layout = Layout {
    variant: LayoutVariant::Py313,
    dict: DictLayout {
        keys_offset: DICT_KEYS,
        values_offset: DICT_VALUES,
        header: LOG2_KEYS,
        split_values_offset: offset_of!(DictValues313, values),
    },
    frame: FrameLayout::Interpreter {
        f_frame_offset: offset_of!(FrameObject311, f_frame),
        code_offset: offset_of!(InterpreterFrame313, f_executable),
        localsplus_offset: offset_of!(InterpreterFrame313, localsplus),
    },
    list_items_offset: LIST_ITEMS,
    cell_ref_offset: CELL_REF,
};

/// The layout this build was compiled for.
pub fn compiled() -> &'static Layout {
    COMPILED.layout()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    VersionMismatch {
        compiled: LayoutVariant,
        runtime: (u8, u8),
    },
    StructuralMismatch {
        probe: &'static str,
        detail: String,
    },
    /// The self-check could not build its probe objects.
    Probe {
        probe: &'static str,
        message: String,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { compiled, runtime } => write!(
                f,
                "layout catalog was compiled for {compiled} but the interpreter is {}.{}",
                runtime.0, runtime.1
            ),
            Self::StructuralMismatch { probe, detail } => {
                write!(f, "layout self-check failed on {probe}: {detail}")
            }
            Self::Probe { probe, message } => {
                write!(f, "could not build layout probe {probe}: {message}")
            }
        }
    }
}

impl Error for LayoutError {}

impl Layout {
    pub fn verify(&self, major: u8, minor: u8) -> Result<(), LayoutError> {
        if major == 3 && self.variant.minors().contains(&minor) {
            Ok(())
        } else {
            Err(LayoutError::VersionMismatch {
                compiled: self.variant,
                runtime: (major, minor),
            })
        }
    }
}

/// Checks the compiled layout against the running interpreter: first the
/// version, then the structural self-check. Tracing must not start unless
/// this succeeds.
pub fn attach(py: Python<'_>) -> Result<&'static Layout, LayoutError> {
    let layout = compiled();
    let version = py.version_info();
    layout.verify(version.major, version.minor)?;
    check::self_check(py, layout)?;
    tracing::debug!(variant = %layout.variant, "layout catalog verified");
    Ok(layout)
}
