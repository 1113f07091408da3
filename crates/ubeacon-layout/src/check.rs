//! Runtime self-check: builds real objects and confirms the catalog reads
//! back what the interpreter's own API reports.

use crate::frame::{locals_base, overlay_code};
use crate::{Layout, LayoutError, locate};
use pyo3::prelude::*;
use pyo3::types::PyDict;

const PROBE_SOURCE: &std::ffi::CStr = c"import sys

class _Probe:
    def __init__(self, alpha, beta):
        self.alpha = alpha
        self.beta = beta

def _frame_probe(marker, other):
    shifted = other + 1
    return sys._getframe()

combined = {'ubeacon': 1, 'na\\u00efve': 2, 3: 'int key', 'gone': 4}
del combined['gone']
instances = [_Probe(1, 'one'), _Probe(2, 'two')]
marker = object()
frame = _frame_probe(marker, 41)
";

fn probe_err(probe: &'static str) -> impl FnOnce(PyErr) -> LayoutError {
    move |err| LayoutError::Probe {
        probe,
        message: err.to_string(),
    }
}

fn mismatch(probe: &'static str, detail: impl Into<String>) -> LayoutError {
    LayoutError::StructuralMismatch {
        probe,
        detail: detail.into(),
    }
}

pub(crate) fn self_check<'py>(py: Python<'py>, layout: &Layout) -> Result<(), LayoutError> {
    let ns = PyDict::new(py);
    py.run(PROBE_SOURCE, Some(&ns), Some(&ns))
        .map_err(probe_err("probe module"))?;

    let get = |name: &'static str| -> Result<Bound<'py, PyAny>, LayoutError> {
        ns.get_item(name)
            .map_err(probe_err(name))?
            .ok_or_else(|| mismatch(name, "probe object missing from namespace"))
    };

    let combined = get("combined")?;
    check_dict(layout, "combined dict", &combined, &["ubeacon", "naïve"], &["gone", "3"])?;

    let instances = get("instances")?;
    for instance in instances.try_iter().map_err(probe_err("split dict"))? {
        let instance = instance.map_err(probe_err("split dict"))?;
        let attrs = instance
            .getattr("__dict__")
            .map_err(probe_err("split dict"))?;
        check_dict(layout, "split dict", &attrs, &["alpha", "beta"], &["gamma"])?;
    }

    let frame = get("frame")?;
    let marker = get("marker")?;
    check_frame(layout, &frame, &marker)
}

fn check_dict(
    layout: &Layout,
    probe: &'static str,
    dict: &Bound<'_, PyAny>,
    present: &[&str],
    absent: &[&str],
) -> Result<(), LayoutError> {
    for key in present {
        let expected = dict.get_item(*key).map_err(probe_err(probe))?;
        let Some(slot) = locate(layout, dict, key) else {
            return Err(mismatch(probe, format!("key {key:?} not found by the locator")));
        };
        // SAFETY: the slot belongs to a dict we hold a reference to.
        let found = unsafe { *slot.as_ptr() };
        if found != expected.as_ptr() {
            return Err(mismatch(
                probe,
                format!(
                    "key {key:?}: slot holds {found:p}, runtime returned {:p}",
                    expected.as_ptr()
                ),
            ));
        }
    }
    for key in absent {
        if locate(layout, dict, key).is_some() {
            return Err(mismatch(probe, format!("absent key {key:?} was located")));
        }
    }
    Ok(())
}

fn check_frame(
    layout: &Layout,
    frame: &Bound<'_, PyAny>,
    marker: &Bound<'_, PyAny>,
) -> Result<(), LayoutError> {
    let code = frame.getattr("f_code").map_err(probe_err("frame"))?;
    // SAFETY: `frame` is a live frame object and the GIL is held.
    let (seen_code, first_local) = unsafe {
        let base = locals_base(layout, frame.as_ptr());
        if base.is_null() {
            return Err(mismatch("frame", "fast-local array is null"));
        }
        (overlay_code(layout, frame.as_ptr()), *base)
    };
    if seen_code != code.as_ptr() {
        return Err(mismatch(
            "frame",
            format!("code pointer {seen_code:p} differs from f_code {:p}", code.as_ptr()),
        ));
    }
    if first_local != marker.as_ptr() {
        return Err(mismatch(
            "frame",
            format!(
                "first fast local {first_local:p} is not the marker argument {:p}",
                marker.as_ptr()
            ),
        ));
    }
    Ok(())
}
