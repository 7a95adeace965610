//! Infragraph — dependency-graph infrastructure provisioning.
//!
//! A stack is expanded into a DAG of resource descriptors whose properties
//! may reference outputs of other resources. The engine plans the DAG into
//! concurrent batches, applies it through a [`provider::Provider`], and keeps
//! BLAKE3-hashed state so re-runs only touch what changed.

pub mod cli;
pub mod core;
pub mod provider;
pub mod stack;
pub mod tripwire;
