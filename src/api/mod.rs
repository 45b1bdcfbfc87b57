pub mod client_ip;
pub mod handlers;
pub mod routes;

pub use handlers::{ApiError, AppState};
pub use routes::create_api_router;
