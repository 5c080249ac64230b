//! End-to-end tests for piecemeal
//!
//! Full streaming workflows: open a reader, let a simulated swarm fetch what
//! the scheduler asks for, and read the file back byte for byte.

mod streaming_workflow;
