//! converge-rest: JSON REST backend for the converge engine
//!
//! Provides:
//! - `RestApi`, a `ResourceApi` over a management REST API
//! - URL templates per resource kind
//! - Long-running operation documents mapped onto job statuses

pub mod client;
pub mod operation;
pub mod routes;

pub use client::{status_error, RestApi};
pub use operation::{submit_response, OperationDocument};
pub use routes::{location_scope, Routes, UpdateRoute, UrlTemplate};
