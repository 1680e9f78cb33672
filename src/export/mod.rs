//! Operational surfaces exposed by the running reader.

pub mod health;
