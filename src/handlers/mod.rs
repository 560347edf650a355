//! Thin axum layer over the services; handlers only extract, delegate, and wrap.

pub mod health;
pub mod payments;
