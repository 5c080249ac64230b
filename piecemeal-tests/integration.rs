//! Integration tests for piecemeal
//!
//! These tests drive the registry, scheduler and readers together against
//! the in-memory piece store and check the scheduling properties that hold
//! across components.

#[path = "integration/scheduler_properties.rs"]
mod scheduler_properties;

#[path = "integration/reader_lifecycle.rs"]
mod reader_lifecycle;

#[path = "integration/fileset_streaming.rs"]
mod fileset_streaming;
