//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers exposing the database URL do not
//! need their own secrecy dependency.

pub use secrecy::{ExposeSecret, SecretString};
