//! HTTP surface for the timetable extraction pipeline.

pub mod api;
pub mod config;
mod server;

pub use config::{CorsConfig, ProxyMode, RateLimitConfig, ServerConfig};
pub use server::{build_router, serve, ApiState, ServerError};
