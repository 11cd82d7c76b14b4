pub mod activity;
pub mod analysis_task;
pub mod auth;
pub mod deals;
pub mod managers;
pub mod middleware;
pub mod rest;
pub mod router;
pub mod state;
pub mod webhook;

pub use middleware::require_auth;
pub use router::build_router;
