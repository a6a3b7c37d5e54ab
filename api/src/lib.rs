// ABOUTME: Thin admin HTTP surface for manual switchover, stop and shutdown
// ABOUTME: Synchronises with the daemon only through the DCS and the shutdown token

mod error;
mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{admin_routes, AdminState};
