//! On-demand snapshots for a stopped program: backtrace, locals, expression
//! evaluation, and watch chains. Each has a value-returning form and a
//! file-writing form used by the C entry points.

use crate::state::TraceState;
use crate::watch;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyString;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use ubeacon_types::{
    Backtrace, FrameRecord, LocalRecord, Locals, WatchChainResponse, WireError, decode_watch_request,
    encode_backtrace, encode_locals, encode_watch_chain,
};

const EVAL_ERROR_FALLBACK: &str = "Python error: (failed to convert error to string)\n";

#[derive(Debug)]
pub enum DumpError {
    Write { path: PathBuf, source: io::Error },
    Encode(WireError),
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { path, source } => {
                write!(f, "could not write {}: {source}", path.display())
            }
            Self::Encode(err) => write!(f, "could not encode dump: {err}"),
        }
    }
}

impl Error for DumpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Write { source, .. } => Some(source),
            Self::Encode(err) => Some(err),
        }
    }
}

/// Runs `f` with the GIL, or returns `empty` when there is no interpreter to
/// ask.
fn with_runtime<T>(empty: T, f: impl FnOnce(Python<'_>) -> T) -> T {
    if unsafe { ffi::Py_IsInitialized() } == 0 {
        return empty;
    }
    Python::attach(f)
}

/// The frame the tracker last saw.
fn tracked_frame<'py>(py: Python<'py>, state: Option<&TraceState>) -> Option<Bound<'py, PyAny>> {
    let frame = state?.current_frame.get();
    // SAFETY: the state owns a reference to the frame, so it is live.
    unsafe { Bound::from_borrowed_ptr_or_opt(py, frame) }
}

/// The tracked frame, else whatever frame this thread is executing.
fn target_frame<'py>(py: Python<'py>, state: Option<&TraceState>) -> Option<Bound<'py, PyAny>> {
    tracked_frame(py, state).or_else(|| {
        // SAFETY: PyEval_GetFrame returns a borrowed frame or null.
        unsafe { Bound::from_borrowed_ptr_or_opt(py, ffi::PyEval_GetFrame().cast()) }
    })
}

pub fn backtrace(py: Python<'_>, state: Option<&TraceState>) -> Backtrace {
    let mut frames = Vec::new();
    let mut cursor = tracked_frame(py, state);
    while let Some(frame) = cursor {
        match frame_record(&frame, frames.len() as u64) {
            Ok(record) => frames.push(record),
            Err(err) => {
                tracing::warn!(%err, "backtrace stopped at unreadable frame");
                break;
            }
        }
        cursor = frame
            .getattr("f_back")
            .ok()
            .filter(|back| !back.is_none());
    }
    Backtrace { frames }
}

fn frame_record(frame: &Bound<'_, PyAny>, frame_no: u64) -> PyResult<FrameRecord> {
    let code = frame.getattr("f_code")?;
    Ok(FrameRecord {
        func_name: lossy_str(&code.getattr("co_name")?)?,
        file_name: lossy_str(&code.getattr("co_filename")?)?,
        line: frame.getattr("f_lineno")?.extract::<Option<u64>>()?.unwrap_or(0),
        frame_no,
    })
}

/// Text of a `str` that may hold lone surrogates, which do not survive a
/// strict UTF-8 conversion.
fn lossy_str(value: &Bound<'_, PyAny>) -> PyResult<String> {
    Ok(value.downcast::<PyString>()?.to_string_lossy().into_owned())
}

/// The namespace locals and evaluation run against.
enum Scope<'py> {
    Frame(Bound<'py, PyAny>),
    Main(Bound<'py, PyAny>),
}

impl<'py> Scope<'py> {
    fn find(py: Python<'py>, state: Option<&TraceState>) -> PyResult<Self> {
        if let Some(frame) = target_frame(py, state) {
            return Ok(Self::Frame(frame));
        }
        Ok(Self::Main(py.import("__main__")?.dict().into_any()))
    }

    fn globals(&self) -> PyResult<Bound<'py, PyAny>> {
        match self {
            Self::Frame(frame) => frame.getattr("f_globals"),
            Self::Main(dict) => Ok(dict.clone()),
        }
    }

    fn locals(&self) -> PyResult<Bound<'py, PyAny>> {
        match self {
            Self::Frame(frame) => frame.getattr("f_locals"),
            Self::Main(dict) => Ok(dict.clone()),
        }
    }
}

pub fn locals(py: Python<'_>, state: Option<&TraceState>) -> Locals {
    let collected = (|| -> PyResult<Vec<LocalRecord>> {
        let namespace = Scope::find(py, state)?.locals()?;
        let mut records = Vec::new();
        for item in namespace.call_method0("items")?.try_iter()? {
            let (name, value): (Bound<'_, PyAny>, Bound<'_, PyAny>) = item?.extract()?;
            // A failing __repr__ only loses this entry.
            let Ok(repr) = value.repr() else {
                continue;
            };
            records.push(LocalRecord {
                name: name.str()?.to_string(),
                value: repr.to_string(),
            });
        }
        Ok(records)
    })();
    match collected {
        Ok(locals) => Locals { locals },
        Err(err) => {
            tracing::warn!(%err, "could not read locals");
            Locals::default()
        }
    }
}

/// Evaluates `source` as an expression in the current scope and returns its
/// repr, or a `Python error: ...` line.
pub fn eval(py: Python<'_>, state: Option<&TraceState>, source: &str) -> String {
    let result = (|| -> PyResult<String> {
        let scope = Scope::find(py, state)?;
        let builtins = py.import("builtins")?;
        let value = builtins
            .getattr("eval")?
            .call1((source, scope.globals()?, scope.locals()?))?;
        Ok(value.repr()?.to_string())
    })();
    result.unwrap_or_else(|err| describe_error(py, &err))
}

fn describe_error(py: Python<'_>, err: &PyErr) -> String {
    let type_name = err.get_type(py).name().map(|name| name.to_string());
    let message = err.value(py).str().map(|text| text.to_string());
    match (type_name, message) {
        (Ok(type_name), Ok(message)) => format!("Python error: {type_name}: {message}\n"),
        _ => EVAL_ERROR_FALLBACK.to_string(),
    }
}

/// Resolves a request already parsed into steps.
pub fn watch_chain(
    py: Python<'_>,
    state: Option<&TraceState>,
    steps: &[ubeacon_types::Step],
) -> WatchChainResponse {
    let Some(layout) = state.map(TraceState::layout) else {
        tracing::warn!("watch chain requested before tracing started");
        return WatchChainResponse::default();
    };
    let frame = target_frame(py, state);
    let links = watch::resolve(py, layout, frame.as_ref(), steps);
    WatchChainResponse::from_links(&links)
}

/// Reads and consumes the request file. A missing or malformed request
/// resolves nothing.
fn take_request(request_path: &Path) -> Vec<ubeacon_types::Step> {
    let text = match std::fs::read_to_string(request_path) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(path = %request_path.display(), %err, "could not read watch request");
            return Vec::new();
        }
    };
    if let Err(err) = std::fs::remove_file(request_path) {
        tracing::warn!(path = %request_path.display(), %err, "could not remove watch request");
    }
    match decode_watch_request(&text) {
        Ok(steps) => steps,
        Err(err) => {
            tracing::error!(path = %request_path.display(), %err, "malformed watch request");
            Vec::new()
        }
    }
}

fn write_text(path: &Path, text: &str) -> Result<(), DumpError> {
    std::fs::write(path, text).map_err(|source| DumpError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_backtrace(path: &Path, state: Option<&TraceState>) -> Result<(), DumpError> {
    let backtrace = with_runtime(Backtrace::default(), |py| backtrace(py, state));
    let json = encode_backtrace(&backtrace).map_err(DumpError::Encode)?;
    write_text(path, &json)
}

pub fn write_locals(path: &Path, state: Option<&TraceState>) -> Result<(), DumpError> {
    let locals = with_runtime(Locals::default(), |py| locals(py, state));
    let json = encode_locals(&locals).map_err(DumpError::Encode)?;
    write_text(path, &json)
}

pub fn write_eval(path: &Path, state: Option<&TraceState>, source: &str) -> Result<(), DumpError> {
    let text = with_runtime(String::new(), |py| eval(py, state, source));
    write_text(path, &text)
}

pub fn write_watch_chain(
    path: &Path,
    state: Option<&TraceState>,
    request_path: &Path,
) -> Result<(), DumpError> {
    let steps = take_request(request_path);
    let response = with_runtime(WatchChainResponse::default(), |py| {
        watch_chain(py, state, &steps)
    });
    let json = encode_watch_chain(&response).map_err(DumpError::Encode)?;
    write_text(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyDict;
    use std::ffi::CStr;
    use ubeacon_layout::ffi::PY_TRACE_LINE;

    fn state_at<'py>(
        py: Python<'py>,
        source: &CStr,
    ) -> (&'static TraceState, Bound<'py, PyDict>) {
        let ns = PyDict::new(py);
        py.run(source, Some(&ns), Some(&ns)).expect("scenario runs");
        let frame = ns.get_item("frame").expect("get").expect("frame");
        let state: &'static TraceState =
            Box::leak(Box::new(TraceState::new(py, ubeacon_layout::compiled())));
        unsafe { state.dispatch(frame.as_ptr(), PY_TRACE_LINE, std::ptr::null_mut()) };
        (state, ns)
    }

    const NESTED: &CStr = c"import sys
def inner(count):
    label = 'ready'
    return sys._getframe()
def outer():
    return inner(3)
frame = outer()
";

    #[test]
    fn backtrace_starts_at_current_frame() {
        Python::attach(|py| {
            let (state, _ns) = state_at(py, NESTED);
            let frames = backtrace(py, Some(state)).frames;
            let names: Vec<&str> = frames.iter().map(|f| f.func_name.as_str()).collect();
            assert_eq!(&names[..3], ["inner", "outer", "<module>"]);
            assert_eq!(frames[0].line, 4);
            assert_eq!(frames[0].file_name, "<string>");
            let numbers: Vec<u64> = frames.iter().map(|f| f.frame_no).collect();
            assert_eq!(numbers, (0..frames.len() as u64).collect::<Vec<_>>());
            unsafe { state.reset() };
        });
    }

    #[test]
    fn backtrace_walks_past_undecodable_file_names() {
        Python::attach(|py| {
            let (state, _ns) = state_at(
                py,
                c"import sys
def inner():
    return sys._getframe()
odd = compile('def outer():\\n    return inner()\\n', 'odd\\udcff.py', 'exec')
exec(odd)
frame = outer()
",
            );
            let frames = backtrace(py, Some(state)).frames;
            let names: Vec<&str> = frames.iter().map(|f| f.func_name.as_str()).collect();
            assert_eq!(&names[..3], ["inner", "outer", "<module>"]);
            assert!(frames[1].file_name.starts_with("odd"));
            assert!(frames[1].file_name.ends_with(".py"));
            unsafe { state.reset() };
        });
    }

    #[test]
    fn backtrace_without_frame_is_empty() {
        Python::attach(|py| {
            assert!(backtrace(py, None).frames.is_empty());
        });
    }

    #[test]
    fn locals_are_name_repr_pairs() {
        Python::attach(|py| {
            let (state, _ns) = state_at(py, NESTED);
            let locals = locals(py, Some(state)).locals;
            assert_eq!(
                locals,
                vec![
                    LocalRecord {
                        name: "count".into(),
                        value: "3".into(),
                    },
                    LocalRecord {
                        name: "label".into(),
                        value: "'ready'".into(),
                    },
                ]
            );
            unsafe { state.reset() };
        });
    }

    #[test]
    fn locals_skip_values_whose_repr_fails() {
        Python::attach(|py| {
            let (state, _ns) = state_at(
                py,
                c"import sys
class Loud:
    def __repr__(self):
        raise RuntimeError('no')
def probe():
    bad = Loud()
    good = 1
    return sys._getframe()
frame = probe()
",
            );
            let names: Vec<String> = locals(py, Some(state))
                .locals
                .into_iter()
                .map(|l| l.name)
                .collect();
            assert_eq!(names, ["good"]);
            unsafe { state.reset() };
        });
    }

    #[test]
    fn eval_uses_frame_scope() {
        Python::attach(|py| {
            let (state, _ns) = state_at(py, NESTED);
            assert_eq!(eval(py, Some(state), "count * 2"), "6");
            assert_eq!(eval(py, Some(state), "label.upper()"), "'READY'");
            assert_eq!(eval(py, Some(state), "sys.maxsize > 0"), "True");
            unsafe { state.reset() };
        });
    }

    #[test]
    fn eval_reports_python_errors() {
        Python::attach(|py| {
            assert_eq!(
                eval(py, None, "1/0"),
                "Python error: ZeroDivisionError: division by zero\n"
            );
            let undefined = eval(py, None, "definitely_not_defined_anywhere");
            assert!(undefined.starts_with("Python error: NameError: "));
        });
    }

    #[test]
    fn watch_request_is_consumed() {
        Python::attach(|py| {
            let (state, _ns) = state_at(
                py,
                c"import sys
def probe():
    items = [10, 20, 30]
    return sys._getframe()
frame = probe()
",
            );
            let dir = tempfile::tempdir().expect("tempdir");
            let request = dir.path().join("request.json");
            let output = dir.path().join("links.json");
            std::fs::write(
                &request,
                r#"{"steps":[{"type":"name","name":"items"},{"type":"index","index":1}]}"#,
            )
            .expect("write request");

            let steps = take_request(&request);
            assert!(!request.exists());
            let response = watch_chain(py, Some(state), &steps);
            assert_eq!(response.links.len(), 2);
            assert_eq!(response.links[1].link_type, ubeacon_types::LinkType::ListItem);
            assert!(response.links[1].guard_addr.is_some());

            let json = encode_watch_chain(&response).expect("encode");
            write_text(&output, &json).expect("write");
            let written = std::fs::read_to_string(&output).expect("read");
            assert!(written.starts_with(r#"{"links":[{"storage_addr":"0x"#));
            unsafe { state.reset() };
        });
    }

    #[test]
    fn malformed_request_resolves_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = dir.path().join("request.json");
        std::fs::write(&request, r#"{"steps":[{"type":"call"}]}"#).expect("write");
        assert!(take_request(&request).is_empty());
        assert!(take_request(&dir.path().join("missing.json")).is_empty());
    }

    #[test]
    fn unwritable_output_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("no-such-dir").join("out.json");
        let err = write_eval(&path, None, "1").expect_err("parent directory is missing");
        assert!(matches!(err, DumpError::Write { .. }));
    }
}
