//! Tripwire — BLAKE3 property hashing, provenance event log, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
