//! HTTP control-plane surface.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::router;
pub use state::AppState;
