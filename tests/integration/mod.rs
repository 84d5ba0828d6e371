//! Integration test suite for cadre.
//!
//! Each scenario drives a real [`Orchestrator`](cadre::orchestration::Orchestrator)
//! over an in-memory store, stepping its work queue by hand so the order
//! of assignments can be asserted.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Submission to synthesized result
//! - `scheduling`: Batch cap, tie-breaks and quota deferral
//! - `event_bus`: Schemas and handler isolation
//! - `recovery`: Failure policies and human escalation
//!
//! # CI Compatibility
//!
//! The oracle is scripted; no external process is started.

mod fixtures;

mod event_bus;
mod recovery;
mod scheduling;
mod workflow_e2e;
