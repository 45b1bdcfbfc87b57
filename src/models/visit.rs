use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Typed reference to any registered entity: a visitable (post, page) or a
/// visitor (user, account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub id: i64,
}

impl EntityRef {
    pub fn new(type_tag: impl Into<String>, id: i64) -> Self {
        Self {
            type_tag: type_tag.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_tag, self.id)
    }
}

/// The entity being visited.
pub type VisitableRef = EntityRef;

/// Canonical identity of whoever visited: a registered entity or a bare IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VisitorKey {
    Identified {
        #[serde(flatten)]
        entity: EntityRef,
    },
    Anonymous {
        ip: String,
    },
}

impl VisitorKey {
    pub fn identified(entity: EntityRef) -> Self {
        Self::Identified { entity }
    }

    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self::Anonymous { ip: ip.into() }
    }

    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Identified { entity } => Some(entity),
            Self::Anonymous { .. } => None,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        match self {
            Self::Identified { .. } => None,
            Self::Anonymous { ip } => Some(ip),
        }
    }
}

impl fmt::Display for VisitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identified { entity } => entity.fmt(f),
            Self::Anonymous { ip } => write!(f, "ip:{ip}"),
        }
    }
}

/// Caller-supplied values for the free-form columns of a visit row.
pub type VisitAttributes = BTreeMap<String, String>;

/// Column names a caller can never overwrite through attributes.
pub const ASSOCIATIVE_FIELDS: &[&str] = &[
    "visitable_id",
    "visitable_type",
    "visitor_id",
    "visitor_type",
    "ip",
];

/// Bookkeeping columns maintained by the tracker itself.
pub const BOOKKEEPING_FIELDS: &[&str] = &["id", "visits", "created_at", "updated_at"];

/// One unique (visitable, visitor) pairing and how often it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: i64,
    pub visitable: VisitableRef,
    pub visitor: VisitorKey,
    #[serde(rename = "visits")]
    pub count: i64,
    /// Unix timestamp of the first visit
    pub created_at: i64,
    /// Unix timestamp of the latest visit
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: VisitAttributes,
}

impl Visit {
    pub fn first_visited_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_visited_at(&self) -> i64 {
        self.updated_at
    }
}

/// A pairing row that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewVisit {
    pub visitable: VisitableRef,
    pub visitor: VisitorKey,
    pub count: i64,
    pub attributes: VisitAttributes,
}

impl NewVisit {
    /// Starts at zero; the tracker bumps it before the row is written.
    pub fn new(visitable: VisitableRef, visitor: VisitorKey, attributes: VisitAttributes) -> Self {
        Self {
            visitable,
            visitor,
            count: 0,
            attributes,
        }
    }
}

/// Denormalized aggregates kept next to a visitable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitableCounters {
    pub total_visits: i64,
    pub unique_visitors: i64,
}
