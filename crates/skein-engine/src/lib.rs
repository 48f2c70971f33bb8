//! Workflow execution engine: drives a DAG of multi-stage plugin steps to
//! completion.
//!
//! The engine consumes a compiled workflow — a directed acyclic graph whose
//! nodes are scheduling points (stage inputs, stage outputs, the synthetic
//! `input` gate, and the workflow `output`) — and schedules each stage as
//! soon as its dependencies are met. Stage inputs are templates with embedded
//! expressions, resolved against a live data model that accumulates stage
//! outputs as steps report progress.
//!
//! Module map:
//! - `graph` -- id-addressed directed graph over petgraph (ready set, node
//!   removal, inbound enumeration, Mermaid rendering)
//! - `dag` -- DAG node payloads and the stable node-id grammar
//! - `expression` -- expression capability, template trees, and the recursive
//!   resolver
//! - `schema` -- validation scope capability and bundled scopes
//! - `step` -- runnable/running step capabilities and the stage-change
//!   handler contract
//! - `context` -- the live data model and the immutable workflow context
//! - `executor` -- the executor front-end, scheduler loop, and deadlock
//!   detection

pub mod context;
pub mod dag;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod schema;
pub mod step;
