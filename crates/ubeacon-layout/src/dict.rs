use crate::overlay::{DICT_KEYS_GENERAL, DICT_KEYS_SPLIT, DICT_KEYS_UNICODE};
use crate::{DictLayout, EntryLayout, GENERAL_ENTRY, KeysHeader, Layout, UNICODE_ENTRY};
use pyo3::ffi::{self, PyObject, Py_ssize_t};
use pyo3::prelude::*;
use std::ffi::CString;
use std::ptr::NonNull;

/// A string key prepared for comparing against dict keys without creating a
/// Python object for it.
#[derive(Debug, Clone)]
pub struct ProbeKey<'a> {
    text: &'a str,
    ascii: Option<CString>,
}

impl<'a> ProbeKey<'a> {
    pub fn new(text: &'a str) -> Self {
        let ascii = if text.is_ascii() {
            CString::new(text).ok()
        } else {
            None
        };
        Self { text, ascii }
    }

    pub fn as_str(&self) -> &'a str {
        self.text
    }

    /// # Safety
    /// `key` must be null or a live object, and the GIL must be held.
    unsafe fn matches(&self, key: *mut PyObject) -> bool {
        unsafe {
            if key.is_null() || ffi::PyUnicode_Check(key) == 0 {
                return false;
            }
            if let Some(ascii) = &self.ascii {
                return ffi::PyUnicode_CompareWithASCIIString(key, ascii.as_ptr()) == 0;
            }
            let mut len: Py_ssize_t = 0;
            let data = ffi::PyUnicode_AsUTF8AndSize(key, &mut len);
            if data.is_null() {
                // Lone surrogates have no UTF-8 form and cannot equal a Rust str.
                ffi::PyErr_Clear();
                return false;
            }
            let Ok(len) = usize::try_from(len) else {
                return false;
            };
            std::slice::from_raw_parts(data.cast::<u8>(), len) == self.text.as_bytes()
        }
    }
}

/// Address of the value slot for `key` in `map`.
///
/// `None` when `map` is not a dict, the key is absent, or the slot is empty.
pub fn locate(
    layout: &Layout,
    map: &Bound<'_, PyAny>,
    key: &str,
) -> Option<NonNull<*mut PyObject>> {
    // SAFETY: a Bound is a live object and proves the GIL is held.
    unsafe { locate_raw(layout, map.as_ptr(), &ProbeKey::new(key)) }
}

/// # Safety
/// `map` must be null or a live object, and the GIL must be held for as long
/// as the returned slot is used.
pub unsafe fn locate_raw(
    layout: &Layout,
    map: *mut PyObject,
    key: &ProbeKey<'_>,
) -> Option<NonNull<*mut PyObject>> {
    unsafe {
        if map.is_null() || ffi::PyDict_CheckExact(map) == 0 {
            return None;
        }
        let base = map.cast::<u8>();
        let keys = *base.add(layout.dict.keys_offset).cast::<*const u8>();
        let values = *base.add(layout.dict.values_offset).cast::<*mut u8>();
        if keys.is_null() {
            return None;
        }
        locate_in_table(&layout.dict, keys, values, key)
    }
}

/// Scans the entry array of a key table. `values` is null for combined
/// tables and points at the split value array otherwise.
///
/// # Safety
/// `keys` must point at a key table shaped like `dict.header` describes, and
/// `values`, when non-null, at a value array with room for every entry.
pub(crate) unsafe fn locate_in_table(
    dict: &DictLayout,
    keys: *const u8,
    values: *mut u8,
    key: &ProbeKey<'_>,
) -> Option<NonNull<*mut PyObject>> {
    unsafe {
        let (entries, entry, nentries) = entry_table(dict.header, keys)?;
        for index in 0..nentries {
            let entry_ptr = entries.add(index * entry.stride);
            let stored = *entry_ptr.add(entry.key_offset).cast::<*mut PyObject>();
            if !key.matches(stored) {
                continue;
            }
            let slot = if values.is_null() {
                entry_ptr.add(entry.value_offset).cast::<*mut PyObject>().cast_mut()
            } else {
                values
                    .add(dict.split_values_offset + index * size_of::<*mut PyObject>())
                    .cast::<*mut PyObject>()
            };
            if (*slot).is_null() {
                return None;
            }
            return NonNull::new(slot);
        }
        None
    }
}

unsafe fn entry_table(
    header: KeysHeader,
    keys: *const u8,
) -> Option<(*const u8, EntryLayout, usize)> {
    unsafe {
        match header {
            KeysHeader::Sized {
                size_offset,
                nentries_offset,
                indices_offset,
            } => {
                let size = usize::try_from(*keys.add(size_offset).cast::<Py_ssize_t>()).ok()?;
                let nentries =
                    usize::try_from(*keys.add(nentries_offset).cast::<Py_ssize_t>()).ok()?;
                let index_width = match size {
                    0..=0xff => 1,
                    0x100..=0xffff => 2,
                    0x1_0000..=0xffff_ffff => 4,
                    _ => 8,
                };
                let entries = keys.add(indices_offset + size * index_width);
                Some((entries, GENERAL_ENTRY, nentries))
            }
            KeysHeader::Log2 {
                log2_index_bytes_offset,
                kind_offset,
                nentries_offset,
                indices_offset,
                ..
            } => {
                let log2_index_bytes = u32::from(*keys.add(log2_index_bytes_offset));
                let entry = match *keys.add(kind_offset) {
                    DICT_KEYS_GENERAL => GENERAL_ENTRY,
                    DICT_KEYS_UNICODE | DICT_KEYS_SPLIT => UNICODE_ENTRY,
                    _ => return None,
                };
                let nentries =
                    usize::try_from(*keys.add(nentries_offset).cast::<Py_ssize_t>()).ok()?;
                let entries = keys.add(indices_offset + (1usize << log2_index_bytes));
                Some((entries, entry, nentries))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PY38, PY311, PY313, compiled};
    use pyo3::types::{PyDict, PyInt, PyString};

    fn int(py: Python<'_>, value: i64) -> Bound<'_, PyInt> {
        value.into_pyobject(py).expect("int conversion is infallible")
    }

    fn word<T>(ptr: *mut T) -> u64 {
        ptr as usize as u64
    }

    fn slot_value(slot: NonNull<*mut PyObject>) -> *mut PyObject {
        unsafe { *slot.as_ptr() }
    }

    #[test]
    fn sized_table_with_general_entries() {
        Python::attach(|py| {
            let alpha = PyString::new(py, "alpha");
            let beta = PyString::new(py, "beta");
            let dummy = int(py, 1000);
            let one = int(py, 1);
            let two = int(py, 2);

            // refcnt, dk_size, dk_lookup, dk_usable, dk_nentries, 8 one-byte
            // indices, then three (hash, key, value) entries; the middle one
            // was deleted and carries the dummy key.
            let mut table: Vec<u64> = vec![1, 8, 0, 2, 3, 0];
            table.extend([0, word(alpha.as_ptr()), word(one.as_ptr())]);
            table.extend([0, word(dummy.as_ptr()), 0]);
            table.extend([0, word(beta.as_ptr()), word(two.as_ptr())]);
            let keys = table.as_ptr().cast::<u8>();

            unsafe {
                let found = locate_in_table(
                    &PY38.dict,
                    keys,
                    std::ptr::null_mut(),
                    &ProbeKey::new("beta"),
                )
                .expect("beta is present");
                assert_eq!(found.as_ptr().cast::<u64>(), table.as_ptr().add(6 + 6 + 2).cast_mut());
                assert_eq!(slot_value(found), two.as_ptr());
                assert!(
                    locate_in_table(&PY38.dict, keys, std::ptr::null_mut(), &ProbeKey::new("gamma"))
                        .is_none()
                );
            }
        });
    }

    #[test]
    fn log2_table_with_unicode_entries() {
        Python::attach(|py| {
            let name = PyString::new(py, "naïve");
            let value = int(py, 7);

            // log2_size=3, log2_index_bytes=3, kind=unicode packed into the
            // second word; two (key, value) entries, the first deleted.
            let packed = 3 | (3 << 8) | (u64::from(DICT_KEYS_UNICODE) << 16);
            let mut table: Vec<u64> = vec![1, packed, 3, 2, 0];
            table.extend([0, 0]);
            table.extend([word(name.as_ptr()), word(value.as_ptr())]);
            let keys = table.as_ptr().cast::<u8>();

            unsafe {
                let found = locate_in_table(
                    &PY311.dict,
                    keys,
                    std::ptr::null_mut(),
                    &ProbeKey::new("naïve"),
                )
                .expect("non-ascii key is present");
                assert_eq!(slot_value(found), value.as_ptr());
                assert!(
                    locate_in_table(&PY311.dict, keys, std::ptr::null_mut(), &ProbeKey::new("naive"))
                        .is_none()
                );
            }
        });
    }

    #[test]
    fn split_table_reads_value_array() {
        Python::attach(|py| {
            let alpha = PyString::new(py, "alpha");
            let beta = PyString::new(py, "beta");
            let one = int(py, 1);

            let packed = 3 | (3 << 8) | (u64::from(DICT_KEYS_SPLIT) << 16);
            let mut table: Vec<u64> = vec![1, packed, 3, 2, 0];
            table.extend([word(alpha.as_ptr()), 0]);
            table.extend([word(beta.as_ptr()), 0]);
            let keys = table.as_ptr().cast::<u8>();

            // 3.13 value arrays start after an 8-byte header; beta is unset.
            let mut values: Vec<u64> = vec![0x0101_0002, word(one.as_ptr()), 0];
            let values_ptr = values.as_mut_ptr().cast::<u8>();

            unsafe {
                let found = locate_in_table(&PY313.dict, keys, values_ptr, &ProbeKey::new("alpha"))
                    .expect("alpha has a value");
                assert_eq!(found.as_ptr().cast::<u64>(), values.as_mut_ptr().add(1));
                assert!(
                    locate_in_table(&PY313.dict, keys, values_ptr, &ProbeKey::new("beta")).is_none()
                );
            }
        });
    }

    #[test]
    fn combined_dict_matches_runtime_lookup() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            for (key, value) in [("one", 1), ("two", 2), ("clé", 3), ("gone", 4)] {
                dict.set_item(key, value).expect("set_item");
            }
            dict.set_item(5, "int key").expect("set_item");
            dict.del_item("gone").expect("del_item");
            let layout = compiled();

            for key in ["one", "two", "clé"] {
                let expected = dict
                    .get_item(key)
                    .expect("get_item")
                    .expect("key present");
                let slot = locate(layout, dict.as_any(), key).expect("locator finds key");
                assert_eq!(slot_value(slot), expected.as_ptr(), "key {key}");
            }
            assert!(locate(layout, dict.as_any(), "gone").is_none());
            assert!(locate(layout, dict.as_any(), "5").is_none());
            assert!(locate(layout, dict.as_any(), "missing").is_none());
        });
    }

    #[test]
    fn instance_dict_matches_runtime_lookup() {
        Python::attach(|py| {
            let ns = PyDict::new(py);
            py.run(
                c"class P:\n    def __init__(self, a, b):\n        self.alpha = a\n        self.beta = b\nfirst = P(1, 'x')\nsecond = P(2, 'y')\ndel second.beta\n",
                Some(&ns),
                Some(&ns),
            )
            .expect("probe class should run");
            let layout = compiled();

            // Attributes set in __init__ share the class's keys, so the
            // first instance's dict is split and goes through the value array.
            let first = ns.get_item("first").expect("get").expect("first");
            let first_attrs = first.getattr("__dict__").expect("__dict__");
            let values = unsafe {
                *first_attrs
                    .as_ptr()
                    .cast::<u8>()
                    .add(layout.dict.values_offset)
                    .cast::<*mut u8>()
            };
            assert!(!values.is_null(), "instance dict should be split");

            for name in ["first", "second"] {
                let instance = ns.get_item(name).expect("get").expect("instance");
                let attrs = instance.getattr("__dict__").expect("__dict__");
                let alpha = attrs.get_item("alpha").expect("alpha");
                let slot = locate(layout, &attrs, "alpha").expect("alpha is stored");
                assert_eq!(slot_value(slot), alpha.as_ptr(), "{name}.alpha");
            }
            let second = ns.get_item("second").expect("get").expect("second");
            let attrs = second.getattr("__dict__").expect("__dict__");
            assert!(locate(layout, &attrs, "beta").is_none());
        });
    }

    fn keys_table(dict: &Bound<'_, PyDict>) -> *const u8 {
        unsafe {
            *dict
                .as_ptr()
                .cast::<u8>()
                .add(compiled().dict.keys_offset)
                .cast::<*const u8>()
        }
    }

    #[cfg(any(ubeacon_layout = "py38", ubeacon_layout = "py310"))]
    #[test]
    fn sized_header_matches_live_dict() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            for (key, value) in [("one", 1), ("two", 2), ("three", 3)] {
                dict.set_item(key, value).expect("set_item");
            }
            let KeysHeader::Sized {
                size_offset,
                nentries_offset,
                ..
            } = compiled().dict.header
            else {
                panic!("sized layouts use the sized header");
            };
            let keys = keys_table(&dict);
            unsafe {
                assert_eq!(*keys.add(size_offset).cast::<isize>(), 8);
                assert_eq!(*keys.add(nentries_offset).cast::<isize>(), 3);
            }
            let slot = locate(compiled(), dict.as_any(), "three").expect("three");
            let three = dict.get_item("three").expect("get").expect("three");
            assert_eq!(slot_value(slot), three.as_ptr());
        });
    }

    #[cfg(not(any(ubeacon_layout = "py38", ubeacon_layout = "py310")))]
    #[test]
    fn log2_header_matches_live_dict() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            for (key, value) in [("one", 1), ("two", 2), ("three", 3)] {
                dict.set_item(key, value).expect("set_item");
            }
            let KeysHeader::Log2 {
                log2_size_offset,
                kind_offset,
                nentries_offset,
                ..
            } = compiled().dict.header
            else {
                panic!("3.11 and later use the log2 header");
            };
            let keys = keys_table(&dict);
            unsafe {
                assert_eq!(*keys.add(log2_size_offset), 3);
                assert_eq!(*keys.add(kind_offset), DICT_KEYS_UNICODE);
                assert_eq!(*keys.add(nentries_offset).cast::<isize>(), 3);
            }
        });
    }

    #[test]
    fn dict_subclasses_have_no_slots() {
        Python::attach(|py| {
            let ns = PyDict::new(py);
            py.run(
                c"class Shadow(dict):\n    def __getitem__(self, key):\n        return 'shadowed'\nshadow = Shadow(alpha=1)\nplain = dict(shadow)\n",
                Some(&ns),
                Some(&ns),
            )
            .expect("subclass should build");
            let shadow = ns.get_item("shadow").expect("get").expect("shadow");
            let plain = ns.get_item("plain").expect("get").expect("plain");
            assert!(locate(compiled(), &shadow, "alpha").is_none());
            assert!(unsafe { locate_raw(compiled(), shadow.as_ptr(), &ProbeKey::new("alpha")) }.is_none());
            assert!(locate(compiled(), &plain, "alpha").is_some());
        });
    }

    #[test]
    fn non_dicts_have_no_slots() {
        Python::attach(|py| {
            let list = pyo3::types::PyList::new(py, [1, 2]).expect("list");
            assert!(locate(compiled(), list.as_any(), "append").is_none());
        });
    }
}
