use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::tracker::VisitTracker;

use super::handlers::{
    create_visitable, health_check, list_visits, record_visit, reset_visits, visit_stats,
    visitable_visitors, visited_by, visitor_visitables, visitor_visits, AppState,
};

pub fn create_api_router(tracker: Arc<VisitTracker>, proxy: ProxyConfig) -> Router {
    let state = Arc::new(AppState { tracker, proxy });

    let visitable_routes = Router::new()
        .route("/{type_tag}/{id}", post(create_visitable))
        .route(
            "/{type_tag}/{id}/visits",
            post(record_visit).get(list_visits).delete(reset_visits),
        )
        .route("/{type_tag}/{id}/stats", get(visit_stats))
        .route("/{type_tag}/{id}/visited_by", get(visited_by))
        .route("/{type_tag}/{id}/visitors", get(visitable_visitors));

    let visitor_routes = Router::new()
        .route("/{type_tag}/{id}/visits", get(visitor_visits))
        .route("/{type_tag}/{id}/visitables", get(visitor_visitables));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/visitables", visitable_routes)
        .nest("/api/visitors", visitor_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
