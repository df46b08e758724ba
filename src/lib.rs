//! Conductor - job controller for one workflow run in a reproducible-analysis
//! platform.
//!
//! An instance of the controller is co-located with the workflow engine of a
//! single running workflow. It accepts job submissions over HTTP, dispatches
//! each job to a compute backend (Kubernetes, an HTC grid, an HPC batch
//! cluster, or a remote HTC pool), tracks job lifecycles to a terminal state,
//! captures logs, records everything in the shared database and answers
//! queries about live jobs. A content-addressed job cache lets a workflow
//! skip re-executing a job whose inputs and command are byte-equivalent to a
//! previously finished one.

pub mod backends;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod shutdown;
