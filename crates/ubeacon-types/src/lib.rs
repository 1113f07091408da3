//! Shared vocabulary between the in-process agent and the debugger that
//! drives it: the JSON shapes of the file channel, address rendering, and the
//! string identity hash used by breakpoint conditions.

use facet::Facet;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;

mod wire;

pub use wire::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroAddress(&'static str),
    UnknownStepType(String),
    MissingStepField {
        step: &'static str,
        field: &'static str,
    },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroAddress(field) => write!(f, "{field} must be a non-null address"),
            Self::UnknownStepType(kind) => write!(f, "unknown watch step type {kind:?}"),
            Self::MissingStepField { step, field } => {
                write!(f, "watch step {step:?} requires field {field:?}")
            }
        }
    }
}

impl Error for InvariantError {}

/// A non-null address inside the monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(NonZeroUsize);

impl Address {
    pub fn new(value: usize) -> Result<Self, InvariantError> {
        NonZeroUsize::new(value)
            .map(Self)
            .ok_or(InvariantError::ZeroAddress("address"))
    }

    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Lowercase hex with a `0x` prefix, the only address spelling the
    /// debugger accepts.
    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0.get())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0.get())
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a over the code points of `text`.
///
/// Breakpoint conditions in the debugger can only compare integers, so file,
/// function, and exception-type names are published as this hash next to the
/// string pointer. The debugger hashes Python `str`s one code point at a time
/// with the same constants, so non-ASCII names agree on both sides. The empty
/// string hashes to the offset basis; callers publish 0 for a missing name.
pub fn identity_hash(text: &str) -> u64 {
    text.chars().fold(FNV_OFFSET_BASIS, |hash, c| {
        (hash ^ u64::from(u32::from(c))).wrapping_mul(FNV_PRIME)
    })
}

/// How a watch-chain link reached its value.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum LinkType {
    /// Fast-local slot (or closure cell) of the current frame.
    Local,
    /// Entry in the frame's globals dict.
    Global,
    /// Element of a list's item array.
    ListItem,
    /// Value slot of a dict entry.
    DictKey,
    /// Value slot in an instance `__dict__`.
    DictAttr,
    /// Attribute with no fixed storage: `__slots__`, properties, descriptors.
    SlotAttr,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::ListItem => "list_item",
            Self::DictKey => "dict_key",
            Self::DictAttr => "dict_attr",
            Self::SlotAttr => "slot_attr",
        }
    }
}

/// One resolved step of a watch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Where the pointer to the value lives. `None` when the value has no
    /// fixed home (computed attributes).
    pub storage_addr: Option<Address>,
    pub current_value: Address,
    pub link_type: LinkType,
    /// Present for containers whose backing storage is reallocated on
    /// growth. The debugger re-resolves when the contents of this address
    /// change.
    pub guard_addr: Option<Address>,
}

/// One access step of a watch chain, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Name(String),
    Index(i64),
    Key(String),
    Attr(String),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Name(_) => "name",
            Self::Index(_) => "index",
            Self::Key(_) => "key",
            Self::Attr(_) => "attr",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, "[{key:?}]"),
            Self::Attr(name) => write!(f, ".{name}"),
        }
    }
}
