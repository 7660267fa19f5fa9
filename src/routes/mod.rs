//! HTTP route handlers grouped by resource domain.
//!
//! Each submodule corresponds to a logical area of the API (health, gmail
//! scan sessions, one-shot email scans, merchant overrides) and exposes
//! typed Rocket handlers annotated with `#[openapi]` so `rocket_okapi` can
//! derive an OpenAPI document automatically.

pub mod email;
pub mod health;
pub mod merchant;
pub mod scan;
