//! Portcullis - policy-evaluating authorization gate
//!
//! Admits or rejects HTTP requests by evaluating a compiled policy against
//! the request method, path and caller identity, in front of any axum router.

pub mod gate;
pub mod policy;
pub mod remote_addr;
pub mod settings;
pub mod web;
