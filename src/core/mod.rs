//! Core engine — types, graph building, output resolution, planning, execution.

pub mod error;
pub mod executor;
pub mod graph;
pub mod output;
pub mod parser;
pub mod planner;
pub mod schema;
pub mod state;
pub mod template;
pub mod types;
