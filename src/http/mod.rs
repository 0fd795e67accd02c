//! HTTP surface: router, endpoints, error responses

pub mod routes;

pub use routes::build_router;
