//! REST control surface
//!
//! Thin axum layer over the engine: routes map 1:1 onto the control
//! surface, authentication is upstream and arrives as an `x-user-id`
//! header, and error kinds map to status codes without leaking internals.

pub mod models;
pub mod rest;

pub use rest::{router, serve};
