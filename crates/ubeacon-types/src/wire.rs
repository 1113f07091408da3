use facet::Facet;

use crate::{Address, InvariantError, Link, LinkType, Step};

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub func_name: String,
    pub file_name: String,
    pub line: u64,
    pub frame_no: u64,
}

/// Current frame first, oldest call last.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<FrameRecord>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub name: String,
    /// `repr()` of the value, not a structured encoding.
    pub value: String,
}

#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct Locals {
    pub locals: Vec<LocalRecord>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub storage_addr: Option<String>,
    pub current_value: String,
    pub link_type: LinkType,
    pub guard_addr: Option<String>,
}

impl From<&Link> for LinkRecord {
    fn from(link: &Link) -> Self {
        Self {
            storage_addr: link.storage_addr.map(Address::to_hex),
            current_value: link.current_value.to_hex(),
            link_type: link.link_type,
            guard_addr: link.guard_addr.map(Address::to_hex),
        }
    }
}

#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchChainResponse {
    pub links: Vec<LinkRecord>,
}

impl WatchChainResponse {
    pub fn from_links(links: &[Link]) -> Self {
        Self {
            links: links.iter().map(LinkRecord::from).collect(),
        }
    }
}

/// A step as it appears on the wire: a `type` tag plus the one field that
/// type needs.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRecord {
    #[facet(rename = "type")]
    pub kind: String,
    #[facet(default)]
    pub name: Option<String>,
    #[facet(default)]
    pub index: Option<i64>,
    #[facet(default)]
    pub key: Option<String>,
}

impl StepRecord {
    pub fn into_step(self) -> Result<Step, InvariantError> {
        match self.kind.as_str() {
            "name" => self.name.map(Step::Name).ok_or(InvariantError::MissingStepField {
                step: "name",
                field: "name",
            }),
            "attr" => self.name.map(Step::Attr).ok_or(InvariantError::MissingStepField {
                step: "attr",
                field: "name",
            }),
            "index" => self.index.map(Step::Index).ok_or(InvariantError::MissingStepField {
                step: "index",
                field: "index",
            }),
            "key" => self.key.map(Step::Key).ok_or(InvariantError::MissingStepField {
                step: "key",
                field: "key",
            }),
            _ => Err(InvariantError::UnknownStepType(self.kind)),
        }
    }
}

impl From<&Step> for StepRecord {
    fn from(step: &Step) -> Self {
        let kind = step.kind().to_string();
        match step {
            Step::Name(name) | Step::Attr(name) => Self {
                kind,
                name: Some(name.clone()),
                ..Self::default()
            },
            Step::Index(index) => Self {
                kind,
                index: Some(*index),
                ..Self::default()
            },
            Step::Key(key) => Self {
                kind,
                key: Some(key.clone()),
                ..Self::default()
            },
        }
    }
}

#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchChainRequest {
    pub steps: Vec<StepRecord>,
}

impl WatchChainRequest {
    pub fn from_steps(steps: &[Step]) -> Self {
        Self {
            steps: steps.iter().map(StepRecord::from).collect(),
        }
    }

    pub fn into_steps(self) -> Result<Vec<Step>, InvariantError> {
        self.steps.into_iter().map(StepRecord::into_step).collect()
    }
}

#[derive(Debug)]
pub enum WireError {
    Json(String),
    Invariant(InvariantError),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "{err}"),
            Self::Invariant(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<InvariantError> for WireError {
    fn from(value: InvariantError) -> Self {
        Self::Invariant(value)
    }
}

pub fn encode_backtrace(backtrace: &Backtrace) -> Result<String, WireError> {
    facet_json::to_string(backtrace).map_err(|e| WireError::Json(e.to_string()))
}

pub fn encode_locals(locals: &Locals) -> Result<String, WireError> {
    facet_json::to_string(locals).map_err(|e| WireError::Json(e.to_string()))
}

pub fn encode_watch_chain(response: &WatchChainResponse) -> Result<String, WireError> {
    facet_json::to_string(response).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_watch_request(json: &str) -> Result<Vec<Step>, WireError> {
    let request: WatchChainRequest =
        facet_json::from_str(json).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(request.into_steps()?)
}
