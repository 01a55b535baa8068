//! Utilities for cryptographic purposes

pub mod ct;
