pub mod audit;
pub mod error;
pub mod handlers;
pub mod loops;
pub mod middleware;
pub mod plans;
pub mod routes;
pub mod tasks;

pub use error::{ApiError, ErrorResponse};
pub use routes::create_router;
