//! Capability registry for visitable and visitor entity types
//!
//! Entity types opt in to visit tracking by being registered here once at
//! startup. The resulting `Registry` is immutable and shared behind an `Arc`;
//! every lookup afterwards is a plain map access.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{VisitError, VisitResult};
use crate::models::{VisitAttributes, ASSOCIATIVE_FIELDS, BOOKKEEPING_FIELDS};

/// Registration options for one visitable entity type, as written by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitableOptions {
    pub name: String,
    /// Visitor types allowed to visit (plural names are accepted). Empty means
    /// any registered visitor type.
    #[serde(default)]
    pub by: Vec<String>,
    #[serde(default, alias = "anonymous")]
    pub accept_ip: bool,
    #[serde(default)]
    pub counter_cache: bool,
    /// Free-form TEXT columns on the visits table that callers may set.
    #[serde(default)]
    pub extra_columns: Vec<String>,
}

impl VisitableOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn by<I, S>(mut self, visitor_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by = visitor_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn accept_ip(mut self, accept_ip: bool) -> Self {
        self.accept_ip = accept_ip;
        self
    }

    pub fn counter_cache(mut self, counter_cache: bool) -> Self {
        self.counter_cache = counter_cache;
        self
    }

    pub fn extra_column(mut self, column: impl Into<String>) -> Self {
        self.extra_columns.push(column.into());
        self
    }
}

/// Serialized form of a whole registry (see `VISITRACK_REGISTRY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDefinition {
    #[serde(default = "RegistryDefinition::default_visitor_types")]
    pub visitor_types: Vec<String>,
    #[serde(default)]
    pub visitables: Vec<VisitableOptions>,
}

impl RegistryDefinition {
    fn default_visitor_types() -> Vec<String> {
        vec!["user".to_string(), "account".to_string()]
    }
}

impl Default for RegistryDefinition {
    fn default() -> Self {
        Self {
            visitor_types: Self::default_visitor_types(),
            visitables: Vec::new(),
        }
    }
}

/// Resolved, validated configuration of a visitable type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitableConfig {
    pub name: String,
    pub accepted_visitor_types: BTreeSet<String>,
    pub accept_ip: bool,
    pub counter_cache: bool,
    pub extra_columns: Vec<String>,
}

impl VisitableConfig {
    pub fn accepts_visitor_type(&self, type_tag: &str) -> bool {
        self.accepted_visitor_types.is_empty() || self.accepted_visitor_types.contains(type_tag)
    }

    /// Keep only attributes that map onto a declared extra column.
    pub fn writable_attributes(&self, attributes: &VisitAttributes) -> VisitAttributes {
        attributes
            .iter()
            .filter(|(name, _)| self.extra_columns.iter().any(|c| c == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    visitor_types: BTreeSet<String>,
    visitables: HashMap<String, VisitableConfig>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn from_definition(definition: RegistryDefinition) -> VisitResult<Self> {
        let mut builder = Self::builder();
        for visitor_type in definition.visitor_types {
            builder = builder.visitor_type(visitor_type);
        }
        for options in definition.visitables {
            builder = builder.visitable(options);
        }
        builder.build()
    }

    /// Configuration of a visitable type, or `InvalidConfigValue` when the
    /// type never opted in.
    pub fn visitable(&self, type_tag: &str) -> VisitResult<&VisitableConfig> {
        self.visitables
            .get(type_tag)
            .ok_or_else(|| VisitError::invalid_config(format!("'{type_tag}' is not visitable")))
    }

    pub fn is_visitable(&self, type_tag: &str) -> bool {
        self.visitables.contains_key(type_tag)
    }

    pub fn is_visitor_type(&self, type_tag: &str) -> bool {
        self.visitor_types.contains(type_tag)
    }

    pub fn visitable_types(&self) -> impl Iterator<Item = &str> {
        self.visitables.keys().map(String::as_str)
    }

    /// Union of every visitable's extra columns; the visits table carries all of them.
    pub fn extra_columns(&self) -> Vec<String> {
        self.visitables
            .values()
            .flat_map(|config| config.extra_columns.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    visitor_types: Vec<String>,
    visitables: Vec<VisitableOptions>,
}

impl RegistryBuilder {
    pub fn visitor_type(mut self, name: impl Into<String>) -> Self {
        self.visitor_types.push(name.into());
        self
    }

    pub fn visitable(mut self, options: VisitableOptions) -> Self {
        self.visitables.push(options);
        self
    }

    pub fn build(self) -> VisitResult<Registry> {
        let mut visitor_types = BTreeSet::new();
        for name in self.visitor_types {
            let name = singularize(&name);
            if !is_identifier(&name) {
                return Err(VisitError::invalid_config(format!(
                    "visitor type name '{name}' is not a valid identifier"
                )));
            }
            visitor_types.insert(name);
        }

        let mut visitables = HashMap::new();
        for options in self.visitables {
            let config = resolve_visitable(options, &visitor_types)?;
            if visitables.contains_key(&config.name) {
                return Err(VisitError::invalid_config(format!(
                    "visitable '{}' registered twice",
                    config.name
                )));
            }
            tracing::debug!(
                visitable = %config.name,
                accept_ip = config.accept_ip,
                counter_cache = config.counter_cache,
                "registered visitable type"
            );
            visitables.insert(config.name.clone(), config);
        }

        Ok(Registry {
            visitor_types,
            visitables,
        })
    }
}

fn resolve_visitable(
    options: VisitableOptions,
    visitor_types: &BTreeSet<String>,
) -> VisitResult<VisitableConfig> {
    let name = options.name.trim().to_string();
    if !is_identifier(&name) {
        return Err(VisitError::invalid_config(format!(
            "visitable name '{name}' is not a valid identifier"
        )));
    }

    let mut accepted_visitor_types = BTreeSet::new();
    for class_name in &options.by {
        let visitor_type = singularize(class_name);
        if !visitor_types.contains(&visitor_type) {
            return Err(VisitError::invalid_config(format!(
                "visitor type '{class_name}' of visitable '{name}' is not registered"
            )));
        }
        accepted_visitor_types.insert(visitor_type);
    }

    let mut extra_columns: Vec<String> = Vec::with_capacity(options.extra_columns.len());
    for column in options.extra_columns {
        let column = column.trim().to_string();
        let reserved = ASSOCIATIVE_FIELDS
            .iter()
            .chain(BOOKKEEPING_FIELDS)
            .any(|field| *field == column);
        if reserved || !is_identifier(&column) {
            return Err(VisitError::invalid_config(format!(
                "'{column}' cannot be used as an extra visit column"
            )));
        }
        if !extra_columns.contains(&column) {
            extra_columns.push(column);
        }
    }

    Ok(VisitableConfig {
        name,
        accepted_visitor_types,
        accept_ip: options.accept_ip,
        counter_cache: options.counter_cache,
        extra_columns,
    })
}

/// `users` -> `user`, `categories` -> `category`.
fn singularize(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if let Some(stem) = name.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if name.ends_with("ss") {
        return name;
    }
    if let Some(stem) = name.strip_suffix('s') {
        return stem.to_string();
    }
    name
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
