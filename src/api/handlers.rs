use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use super::client_ip::extract_client_ip;
use crate::config::ProxyConfig;
use crate::error::VisitError;
use crate::models::{EntityRef, Visit, VisitableRef, VisitorKey};
use crate::storage::VisitScope;
use crate::tracker::{Identifier, Identifiers, VisitTracker};

pub struct AppState {
    pub tracker: Arc<VisitTracker>,
    pub proxy: ProxyConfig,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub enum ApiError {
    Visit(VisitError),
    BadRequest(String),
}

impl From<VisitError> for ApiError {
    fn from(err: VisitError) -> Self {
        ApiError::Visit(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Visit(err @ VisitError::InvalidVisitor(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            ApiError::Visit(err @ VisitError::InvalidConfigValue(_)) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            ApiError::Visit(err @ VisitError::Record { .. }) => {
                tracing::error!(error = %err, "visit storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct VisitStats {
    pub visitable: VisitableRef,
    pub total_visits: i64,
    pub unique_visits: i64,
    pub visited: bool,
}

#[derive(Serialize)]
pub struct VisitedByResponse {
    pub visited: bool,
    pub visit: Option<Visit>,
}

#[derive(Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub force: bool,
}

/// Identifier slots as query parameters; entity slots take `type:id` or a bare
/// id (`user=3`).
#[derive(Deserialize, Default)]
pub struct IdentifierQuery {
    pub by: Option<String>,
    pub visitor: Option<String>,
    pub user: Option<String>,
    pub account: Option<String>,
    pub ip: Option<String>,
}

impl IdentifierQuery {
    fn into_identifiers(self) -> Identifiers {
        Identifiers {
            by: self.by.map(parse_identifier),
            visitor: self.visitor.map(parse_identifier),
            user: self.user.map(parse_identifier),
            account: self.account.map(parse_identifier),
            ip: self.ip.map(Identifier::Text),
            ..Identifiers::default()
        }
    }
}

fn parse_identifier(raw: String) -> Identifier {
    if let Ok(id) = raw.trim().parse::<i64>() {
        return Identifier::Id(id);
    }
    if let Some((type_tag, id)) = raw.split_once(':') {
        if let Ok(id) = id.trim().parse::<i64>() {
            return Identifier::Entity(EntityRef::new(type_tag.trim(), id));
        }
    }
    Identifier::Text(raw)
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    /// in_order, most_recent, lowest_visits, highest_visits
    pub order: Option<String>,
    pub limit: Option<i64>,
    /// RFC 3339 timestamps
    pub since: Option<String>,
    pub until: Option<String>,
    pub min_visits: Option<i64>,
    pub max_visits: Option<i64>,
    pub visitor_type: Option<String>,
}

impl ListQuery {
    fn into_scope(self) -> Result<VisitScope, ApiError> {
        let mut scope = VisitScope::new();
        scope = match self.order.as_deref() {
            None | Some("in_order") => scope.in_order(),
            Some("most_recent") => scope.most_recent(),
            Some("lowest_visits") => scope.lowest_visits(),
            Some("highest_visits") => scope.highest_visits(),
            Some(other) => return Err(ApiError::BadRequest(format!("unknown order '{other}'"))),
        };
        let since = self.since.as_deref().map(parse_timestamp).transpose()?;
        let until = self.until.as_deref().map(parse_timestamp).transpose()?;
        scope = match (since, until) {
            (Some(from), Some(to)) => scope.between_dates(from, to),
            (Some(from), None) => scope.since(from),
            (None, Some(to)) => scope.between_dates(DateTime::<Utc>::UNIX_EPOCH, to),
            (None, None) => scope,
        };
        scope = match (self.min_visits, self.max_visits) {
            (Some(min), Some(max)) => scope.with_visits(min..=max),
            (Some(min), None) => scope.with_visits(min..),
            (None, Some(max)) => scope.with_visits(..=max),
            (None, None) => scope,
        };
        if let Some(visitor_type) = self.visitor_type {
            scope = scope.by_visitor_type(visitor_type);
        }
        if let Some(limit) = self.limit {
            scope = scope.limit(limit);
        }
        Ok(scope)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not an RFC 3339 timestamp")))
}

/// Announce a newly created visitable so its counters start at zero
pub async fn create_visitable(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    visitable.created().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Record a visit
///
/// Without any identifier in the body the request's client IP is used.
pub async fn record_visit(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Option<Json<Identifiers>>,
) -> ApiResult<Json<Visit>> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;

    let mut identifiers = body.map(|Json(identifiers)| identifiers).unwrap_or_default();
    if has_no_slot(&identifiers) {
        if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
            let client_ip = extract_client_ip(&headers, addr.ip(), &state.proxy);
            identifiers.ip = Some(Identifier::from(client_ip));
        }
    }

    let visit = visitable.visit(&identifiers).await?;
    Ok(Json(visit))
}

fn has_no_slot(identifiers: &Identifiers) -> bool {
    identifiers.by.is_none()
        && identifiers.visitor.is_none()
        && identifiers.user.is_none()
        && identifiers.account.is_none()
        && identifiers.ip.is_none()
}

/// List visits of a visitable
pub async fn list_visits(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Visit>>> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    let visits = visitable.visits(query.into_scope()?).await?;
    Ok(Json(visits))
}

/// Delete all visits of a visitable
pub async fn reset_visits(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    visitable.reset_visits().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Totals for a visitable
pub async fn visit_stats(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<VisitStats>> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    let total_visits = visitable.total_visits(query.force).await?;
    let unique_visits = visitable.unique_visits(query.force).await?;

    Ok(Json(VisitStats {
        visitable: visitable.entity().clone(),
        total_visits,
        unique_visits,
        visited: unique_visits > 0,
    }))
}

/// Whether a given visitor has visited
pub async fn visited_by(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
    Query(query): Query<IdentifierQuery>,
) -> ApiResult<Json<VisitedByResponse>> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    let visit = visitable.visit_by(&query.into_identifiers()).await?;

    Ok(Json(VisitedByResponse {
        visited: visit.is_some(),
        visit,
    }))
}

/// Visits made by a visitor entity
pub async fn visitor_visits(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Visit>>> {
    let visitor = state.tracker.visitor(EntityRef::new(type_tag, id))?;
    let visits = visitor.visits(query.into_scope()?).await?;
    Ok(Json(visits))
}

/// Entities a visitor has visited
pub async fn visitor_visitables(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
) -> ApiResult<Json<Vec<VisitableRef>>> {
    let visitor = state.tracker.visitor(EntityRef::new(type_tag, id))?;
    Ok(Json(visitor.visitables().await?))
}

/// Everyone who visited a visitable
pub async fn visitable_visitors(
    State(state): State<Arc<AppState>>,
    Path((type_tag, id)): Path<(String, i64)>,
) -> ApiResult<Json<Vec<VisitorKey>>> {
    let visitable = state.tracker.visitable(EntityRef::new(type_tag, id))?;
    Ok(Json(visitable.visitors().await?))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
