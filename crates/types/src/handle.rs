use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of server-side object a handle refers to.
///
/// The hierarchy is fixed: sessions are roots, nodes live under sessions and
/// every record-level object lives under a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    DirectorySession,
    DirectoryNode,
    Record,
    AttributeList,
    AttributeValueList,
}

impl HandleKind {
    /// All kinds, in hierarchy order.
    pub const ALL: [HandleKind; 5] = [
        HandleKind::DirectorySession,
        HandleKind::DirectoryNode,
        HandleKind::Record,
        HandleKind::AttributeList,
        HandleKind::AttributeValueList,
    ];

    /// The only kind a handle of this kind may be parented under.
    ///
    /// `None` means the kind is always a root.
    pub fn required_parent(self) -> Option<HandleKind> {
        match self {
            HandleKind::DirectorySession => None,
            HandleKind::DirectoryNode => Some(HandleKind::DirectorySession),
            HandleKind::Record | HandleKind::AttributeList | HandleKind::AttributeValueList => {
                Some(HandleKind::DirectoryNode)
            }
        }
    }

    pub fn is_root(self) -> bool {
        self.required_parent().is_none()
    }

    /// Stable position used for per-kind counters.
    pub fn index(self) -> usize {
        match self {
            HandleKind::DirectorySession => 0,
            HandleKind::DirectoryNode => 1,
            HandleKind::Record => 2,
            HandleKind::AttributeList => 3,
            HandleKind::AttributeValueList => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::DirectorySession => "directory_session",
            HandleKind::DirectoryNode => "directory_node",
            HandleKind::Record => "record",
            HandleKind::AttributeList => "attribute_list",
            HandleKind::AttributeValueList => "attribute_value_list",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque numeric handle given to clients.
///
/// Zero is reserved to mean "no handle"; the table never issues it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HandleId(u32);

impl HandleId {
    /// The "no handle" value, used as the parent of roots.
    pub const NONE: HandleId = HandleId(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for HandleId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque resume token for a paginated call.
///
/// Tokens use the same numbering discipline as [`HandleId`] in a separate
/// namespace; zero is never issued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContinuationToken(u32);

impl ContinuationToken {
    pub const NONE: ContinuationToken = ContinuationToken(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for ContinuationToken {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
