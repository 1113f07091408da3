//! Resolves an access chain such as `kennel[0].dogs["rex"]` to the memory
//! that holds each value, so the debugger can watch it.

use pyo3::ffi::{self, PyObject};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use std::error::Error;
use std::fmt;
use ubeacon_layout::{CodeNames, Layout, LocalSlot, ffi as cpy, locals_base, locate};
use ubeacon_types::{Address, Link, LinkType, Step};

/// Why a step produced no link. The resolver logs these and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    NoFrame,
    NoCurrentObject,
    NameNotFound(String),
    Unbound(String),
    NotAList { type_name: String },
    IndexOutOfRange { index: i64, len: usize },
    NotADict { type_name: String },
    KeyNotFound(String),
    AttrLookup { name: String, message: String },
    Python(String),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFrame => write!(f, "no current frame"),
            Self::NoCurrentObject => write!(f, "previous step did not resolve"),
            Self::NameNotFound(name) => write!(f, "name {name:?} is neither local nor global"),
            Self::Unbound(name) => write!(f, "local {name:?} is unbound"),
            Self::NotAList { type_name } => write!(f, "cannot index a {type_name}"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for list of length {len}")
            }
            Self::NotADict { type_name } => write!(f, "cannot look up a key in a {type_name}"),
            Self::KeyNotFound(key) => write!(f, "key {key:?} not found"),
            Self::AttrLookup { name, message } => write!(f, "attribute {name:?}: {message}"),
            Self::Python(message) => write!(f, "{message}"),
        }
    }
}

impl Error for StepError {}

impl From<PyErr> for StepError {
    fn from(err: PyErr) -> Self {
        Self::Python(err.to_string())
    }
}

/// Walks `steps` starting from `frame`. Steps that fail are skipped; a later
/// `name` step starts over, so the result is every link that resolved.
///
/// Objects reached along the way are held until this returns, so addresses
/// stay valid for the whole walk even when an attribute is computed.
pub fn resolve<'py>(
    py: Python<'py>,
    layout: &Layout,
    frame: Option<&Bound<'py, PyAny>>,
    steps: &[Step],
) -> Vec<Link> {
    let mut resolver = Resolver {
        py,
        layout,
        frame,
        current: None,
        pins: Vec::new(),
    };
    let mut links = Vec::with_capacity(steps.len());
    for step in steps {
        match resolver.step(step) {
            Ok(link) => links.push(link),
            Err(err) => {
                tracing::debug!(%step, %err, "watch step skipped");
                if let Some(previous) = resolver.current.take() {
                    resolver.pins.push(previous);
                }
            }
        }
    }
    links
}

struct Resolver<'a, 'py> {
    py: Python<'py>,
    layout: &'a Layout,
    frame: Option<&'a Bound<'py, PyAny>>,
    current: Option<Bound<'py, PyAny>>,
    pins: Vec<Bound<'py, PyAny>>,
}

impl<'py> Resolver<'_, 'py> {
    fn step(&mut self, step: &Step) -> Result<Link, StepError> {
        let (link, value) = match step {
            Step::Name(name) => self.name(name)?,
            Step::Index(index) => self.index(*index)?,
            Step::Key(key) => self.key(key)?,
            Step::Attr(name) => self.attr(name)?,
        };
        if let Some(previous) = self.current.replace(value) {
            self.pins.push(previous);
        }
        Ok(link)
    }

    fn current(&self) -> Result<&Bound<'py, PyAny>, StepError> {
        self.current.as_ref().ok_or(StepError::NoCurrentObject)
    }

    /// Takes a new reference to whatever `slot` points at.
    fn load(&self, slot: *mut *mut PyObject) -> Option<Bound<'py, PyAny>> {
        // SAFETY: slots come from live containers we hold and the GIL is held.
        unsafe {
            let value = *slot;
            (!value.is_null()).then(|| Bound::from_borrowed_ptr(self.py, value))
        }
    }

    fn name(&mut self, name: &str) -> Result<(Link, Bound<'py, PyAny>), StepError> {
        let frame = self.frame.ok_or(StepError::NoFrame)?;
        let code = frame.getattr("f_code")?;
        let names = CodeNames::from_code(&code)?;

        if let Some(slot) = names.slot_for(&self.layout.frame, name) {
            // SAFETY: `frame` is a live frame object; the index comes from its
            // own code object.
            let mut storage = unsafe {
                let base = locals_base(self.layout, frame.as_ptr());
                if base.is_null() {
                    return Err(StepError::NoFrame);
                }
                base.add(slot.index())
            };
            let mut value = self
                .load(storage)
                .ok_or_else(|| StepError::Unbound(name.to_string()))?;
            // SAFETY: `value` is live; a cell's content slot sits at a fixed
            // offset inside it.
            if matches!(slot, LocalSlot::Cell(_)) && unsafe { cpy::is_cell(value.as_ptr()) } {
                storage = unsafe {
                    value
                        .as_ptr()
                        .cast::<u8>()
                        .add(self.layout.cell_ref_offset)
                        .cast::<*mut PyObject>()
                };
                let cell = value;
                value = self
                    .load(storage)
                    .ok_or_else(|| StepError::Unbound(name.to_string()))?;
                self.pins.push(cell);
            }
            return Ok((link(Some(storage), &value, LinkType::Local, None)?, value));
        }

        let globals = frame.getattr("f_globals")?;
        let slot = locate(self.layout, &globals, name)
            .ok_or_else(|| StepError::NameNotFound(name.to_string()))?;
        let value = self
            .load(slot.as_ptr())
            .ok_or_else(|| StepError::NameNotFound(name.to_string()))?;
        self.pins.push(globals);
        Ok((link(Some(slot.as_ptr()), &value, LinkType::Global, None)?, value))
    }

    fn index(&mut self, index: i64) -> Result<(Link, Bound<'py, PyAny>), StepError> {
        let list = self.current()?;
        if !list.is_instance_of::<PyList>() {
            return Err(StepError::NotAList {
                type_name: type_name(list),
            });
        }
        // SAFETY: `list` is a live list and the GIL is held.
        let (items_field, len) = unsafe {
            let ptr = list.as_ptr();
            let items_field = ptr
                .cast::<u8>()
                .add(self.layout.list_items_offset)
                .cast::<*mut *mut PyObject>();
            (items_field, usize::try_from(ffi::PyList_Size(ptr)).unwrap_or(0))
        };
        let resolved = if index < 0 {
            usize::try_from(index.unsigned_abs())
                .ok()
                .and_then(|back| len.checked_sub(back))
        } else {
            usize::try_from(index).ok().filter(|i| *i < len)
        };
        let resolved = resolved.ok_or(StepError::IndexOutOfRange { index, len })?;

        // SAFETY: `resolved` is below the list's length.
        let slot = unsafe { (*items_field).add(resolved) };
        let value = self.load(slot).ok_or(StepError::IndexOutOfRange { index, len })?;
        let link = link(
            Some(slot),
            &value,
            LinkType::ListItem,
            Some(items_field.cast::<PyObject>()),
        )?;
        Ok((link, value))
    }

    fn key(&mut self, key: &str) -> Result<(Link, Bound<'py, PyAny>), StepError> {
        let dict = self.current()?;
        if !dict.is_exact_instance_of::<PyDict>() {
            return Err(StepError::NotADict {
                type_name: type_name(dict),
            });
        }
        let slot = locate(self.layout, dict, key)
            .ok_or_else(|| StepError::KeyNotFound(key.to_string()))?;
        let value = self
            .load(slot.as_ptr())
            .ok_or_else(|| StepError::KeyNotFound(key.to_string()))?;
        Ok((link(Some(slot.as_ptr()), &value, LinkType::DictKey, None)?, value))
    }

    fn attr(&mut self, name: &str) -> Result<(Link, Bound<'py, PyAny>), StepError> {
        let owner = self.current()?.clone();
        let value = owner.getattr(name).map_err(|err| StepError::AttrLookup {
            name: name.to_string(),
            message: err.to_string(),
        })?;

        // Only a real instance dict holding this exact object gives the
        // value a fixed home; class mappingproxies and descriptors do not.
        if let Ok(attrs) = owner.getattr("__dict__") {
            if let Some(slot) = locate(self.layout, &attrs, name) {
                // SAFETY: the slot belongs to `attrs`, which we hold.
                if unsafe { *slot.as_ptr() } == value.as_ptr() {
                    self.pins.push(attrs);
                    let link = link(Some(slot.as_ptr()), &value, LinkType::DictAttr, None)?;
                    return Ok((link, value));
                }
            }
        }
        Ok((link(None, &value, LinkType::SlotAttr, None)?, value))
    }
}

fn type_name(obj: &Bound<'_, PyAny>) -> String {
    obj.get_type()
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "object".to_string())
}

fn link(
    storage: Option<*mut *mut PyObject>,
    value: &Bound<'_, PyAny>,
    link_type: LinkType,
    guard: Option<*mut PyObject>,
) -> Result<Link, StepError> {
    let current_value = Address::from_ptr(value.as_ptr())
        .ok_or_else(|| StepError::Python("value pointer is null".to_string()))?;
    Ok(Link {
        storage_addr: storage.and_then(|ptr| Address::from_ptr(ptr)),
        current_value,
        link_type,
        guard_addr: guard.and_then(|ptr| Address::from_ptr(ptr)),
    })
}
