//! Composable filters and orderings over the visits table
//!
//! A `VisitScope` is a plain value describing a query; backends render it to
//! SQL with `to_sql`. Every builder method is named after the read helper it
//! provides (`most_recent`, `since`, `with_visits`, ...).

use chrono::{DateTime, Utc};
use std::ops::{RangeFrom, RangeInclusive, RangeToInclusive};

use crate::models::{VisitableRef, VisitorKey};

use super::sql::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOrder {
    /// Oldest first
    InOrder,
    /// Newest first
    MostRecent,
    LowestVisits,
    HighestVisits,
}

impl ScopeOrder {
    fn as_sql(self) -> &'static str {
        match self {
            ScopeOrder::InOrder => "ORDER BY created_at ASC, id ASC",
            ScopeOrder::MostRecent => "ORDER BY created_at DESC, id DESC",
            ScopeOrder::LowestVisits => "ORDER BY visits ASC, id ASC",
            ScopeOrder::HighestVisits => "ORDER BY visits DESC, id ASC",
        }
    }
}

/// Argument of `recent`: a point in time selects rows since then, a number
/// keeps only that many rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recent {
    Since(DateTime<Utc>),
    Limit(i64),
}

impl From<DateTime<Utc>> for Recent {
    fn from(since: DateTime<Utc>) -> Self {
        Recent::Since(since)
    }
}

impl From<i64> for Recent {
    fn from(limit: i64) -> Self {
        Recent::Limit(limit)
    }
}

/// Bounds on the per-pairing visit count, both inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitCountFilter {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl From<i64> for VisitCountFilter {
    fn from(exact: i64) -> Self {
        Self {
            min: Some(exact),
            max: Some(exact),
        }
    }
}

impl From<RangeInclusive<i64>> for VisitCountFilter {
    fn from(range: RangeInclusive<i64>) -> Self {
        Self {
            min: Some(*range.start()),
            max: Some(*range.end()),
        }
    }
}

impl From<RangeFrom<i64>> for VisitCountFilter {
    fn from(range: RangeFrom<i64>) -> Self {
        Self {
            min: Some(range.start),
            max: None,
        }
    }
}

impl From<RangeToInclusive<i64>> for VisitCountFilter {
    fn from(range: RangeToInclusive<i64>) -> Self {
        Self {
            min: None,
            max: Some(range.end),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitScope {
    visitable: Option<VisitableRef>,
    visitor: Option<VisitorKey>,
    visitable_type: Option<String>,
    visitor_type: Option<String>,
    since: Option<i64>,
    until: Option<i64>,
    visits: VisitCountFilter,
    order: Option<ScopeOrder>,
    limit: Option<i64>,
}

impl VisitScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visits of one visitable.
    pub fn on(mut self, visitable: &VisitableRef) -> Self {
        self.visitable = Some(visitable.clone());
        self
    }

    /// Visits made by one visitor (entity or IP).
    pub fn by(mut self, visitor: &VisitorKey) -> Self {
        self.visitor = Some(visitor.clone());
        self
    }

    pub fn of_visitable_type(mut self, type_tag: impl Into<String>) -> Self {
        self.visitable_type = Some(type_tag.into());
        self
    }

    pub fn by_visitor_type(mut self, type_tag: impl Into<String>) -> Self {
        self.visitor_type = Some(type_tag.into());
        self
    }

    pub fn in_order(self) -> Self {
        self.order(ScopeOrder::InOrder)
    }

    pub fn most_recent(self) -> Self {
        self.order(ScopeOrder::MostRecent)
    }

    pub fn lowest_visits(self) -> Self {
        self.order(ScopeOrder::LowestVisits)
    }

    pub fn highest_visits(self) -> Self {
        self.order(ScopeOrder::HighestVisits)
    }

    pub fn order(mut self, order: ScopeOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, number_of_items: i64) -> Self {
        self.limit = Some(number_of_items.max(0));
        self
    }

    /// First visited at or after `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since.timestamp());
        self
    }

    /// First visited within `[from, to]`.
    pub fn between_dates(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.since = Some(from.timestamp());
        self.until = Some(to.timestamp());
        self
    }

    pub fn recent(self, recent: impl Into<Recent>) -> Self {
        match recent.into() {
            Recent::Since(since) => self.since(since),
            Recent::Limit(limit) => self.limit(limit),
        }
    }

    pub fn with_visits(mut self, filter: impl Into<VisitCountFilter>) -> Self {
        self.visits = filter.into();
        self
    }

    /// Render `WHERE ... ORDER BY ... LIMIT ...` with `?` placeholders.
    ///
    /// The returned values bind positionally in the same order.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut conditions: Vec<&'static str> = Vec::new();
        let mut values = Vec::new();

        if let Some(visitable) = &self.visitable {
            conditions.push("visitable_type = ?");
            conditions.push("visitable_id = ?");
            values.push(SqlValue::Text(visitable.type_tag.clone()));
            values.push(SqlValue::Int(visitable.id));
        }

        match &self.visitor {
            Some(VisitorKey::Identified { entity }) => {
                conditions.push("visitor_type = ?");
                conditions.push("visitor_id = ?");
                values.push(SqlValue::Text(entity.type_tag.clone()));
                values.push(SqlValue::Int(entity.id));
            }
            Some(VisitorKey::Anonymous { ip }) => {
                conditions.push("ip = ?");
                conditions.push("visitor_id IS NULL");
                values.push(SqlValue::Text(ip.clone()));
            }
            None => {}
        }

        if let Some(type_tag) = &self.visitable_type {
            conditions.push("visitable_type = ?");
            values.push(SqlValue::Text(type_tag.clone()));
        }
        if let Some(type_tag) = &self.visitor_type {
            conditions.push("visitor_type = ?");
            values.push(SqlValue::Text(type_tag.clone()));
        }
        if let Some(since) = self.since {
            conditions.push("created_at >= ?");
            values.push(SqlValue::Int(since));
        }
        if let Some(until) = self.until {
            conditions.push("created_at <= ?");
            values.push(SqlValue::Int(until));
        }
        if let Some(min) = self.visits.min {
            conditions.push("visits >= ?");
            values.push(SqlValue::Int(min));
        }
        if let Some(max) = self.visits.max {
            conditions.push("visits <= ?");
            values.push(SqlValue::Int(max));
        }

        let mut sql = String::new();
        if !conditions.is_empty() {
            sql.push_str("WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let order = self.order.unwrap_or(ScopeOrder::InOrder);
        sql.push(' ');
        sql.push_str(order.as_sql());

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Int(limit));
        }

        (sql, values)
    }
}
