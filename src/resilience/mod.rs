//! Backend bootstrap resilience.

pub mod retry;
