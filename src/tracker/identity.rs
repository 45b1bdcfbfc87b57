//! Visitor identity resolution
//!
//! Callers identify a visitor through one of several synonym slots
//! (`by`, `visitor`, `user`, `account`, `ip`). The first non-empty slot in that
//! order wins and is normalized into a `VisitorKey`.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{VisitError, VisitResult};
use crate::models::{EntityRef, VisitAttributes, VisitorKey};
use crate::registry::{Registry, VisitableConfig};

/// Width of the `ip` column on the visits table.
pub const MAX_IP_LENGTH: usize = 24;

/// A single identifier value as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Entity(EntityRef),
    /// Bare id; only meaningful in the `user`/`account` slots, which name the type.
    Id(i64),
    Text(String),
}

impl Identifier {
    fn is_blank(&self) -> bool {
        matches!(self, Identifier::Text(text) if text.trim().is_empty())
    }
}

impl From<EntityRef> for Identifier {
    fn from(entity: EntityRef) -> Self {
        Identifier::Entity(entity)
    }
}

impl From<&EntityRef> for Identifier {
    fn from(entity: &EntityRef) -> Self {
        Identifier::Entity(entity.clone())
    }
}

impl From<i64> for Identifier {
    fn from(id: i64) -> Self {
        Identifier::Id(id)
    }
}

impl From<&str> for Identifier {
    fn from(text: &str) -> Self {
        Identifier::Text(text.to_string())
    }
}

impl From<String> for Identifier {
    fn from(text: String) -> Self {
        Identifier::Text(text)
    }
}

impl From<IpAddr> for Identifier {
    fn from(ip: IpAddr) -> Self {
        Identifier::Text(ip.to_string())
    }
}

/// Identifier slots plus custom visit attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Identifier>,
    #[serde(default, skip_serializing_if = "VisitAttributes::is_empty")]
    pub attributes: VisitAttributes,
}

impl Identifiers {
    pub fn by(value: impl Into<Identifier>) -> Self {
        Self {
            by: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn visitor(value: impl Into<Identifier>) -> Self {
        Self {
            visitor: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn user(value: impl Into<Identifier>) -> Self {
        Self {
            user: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn account(value: impl Into<Identifier>) -> Self {
        Self {
            account: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn ip(value: impl Into<Identifier>) -> Self {
        Self {
            ip: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// First non-empty slot in precedence order, with the slot name.
    fn first_present(&self) -> Option<(&'static str, &Identifier)> {
        [
            ("by", &self.by),
            ("visitor", &self.visitor),
            ("user", &self.user),
            ("account", &self.account),
            ("ip", &self.ip),
        ]
        .into_iter()
        .find_map(|(slot, value)| match value {
            Some(value) if !value.is_blank() => Some((slot, value)),
            _ => None,
        })
    }
}

/// Normalize `identifiers` into a visitor key acceptable for `config`.
pub fn resolve(
    identifiers: &Identifiers,
    config: &VisitableConfig,
    registry: &Registry,
) -> VisitResult<VisitorKey> {
    let Some((slot, value)) = identifiers.first_present() else {
        return Err(VisitError::invalid_visitor(
            "no visitor object or IP provided",
        ));
    };

    match value {
        Identifier::Entity(entity) => resolve_entity(entity.clone(), config, registry),
        Identifier::Id(id) => match slot {
            "user" | "account" => resolve_entity(EntityRef::new(slot, *id), config, registry),
            _ => Err(VisitError::invalid_visitor(format!(
                "bare id {id} given as '{slot}' does not name a visitor type"
            ))),
        },
        Identifier::Text(text) => {
            let text = text.trim();
            let Some(ip) = normalize_ip(text) else {
                return Err(VisitError::invalid_visitor(format!(
                    "visitor is of wrong type: {text:?}"
                )));
            };
            if !config.accept_ip {
                return Err(VisitError::invalid_visitor(format!(
                    "visits based on IP are disabled for '{}'",
                    config.name
                )));
            }
            if ip.len() > MAX_IP_LENGTH {
                return Err(VisitError::invalid_visitor(format!(
                    "IP address {ip} is longer than {MAX_IP_LENGTH} characters"
                )));
            }
            Ok(VisitorKey::anonymous(ip))
        }
    }
}

fn resolve_entity(
    entity: EntityRef,
    config: &VisitableConfig,
    registry: &Registry,
) -> VisitResult<VisitorKey> {
    if !registry.is_visitor_type(&entity.type_tag) {
        return Err(VisitError::invalid_visitor(format!(
            "'{}' is not a registered visitor type",
            entity.type_tag
        )));
    }
    if !config.accepts_visitor_type(&entity.type_tag) {
        return Err(VisitError::invalid_visitor(format!(
            "'{}' may not visit '{}'",
            entity.type_tag, config.name
        )));
    }
    Ok(VisitorKey::identified(entity))
}

/// Canonical textual form of an IP address, or `None` if `text` is not one.
pub fn normalize_ip(text: &str) -> Option<String> {
    text.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
