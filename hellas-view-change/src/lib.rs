//! # View Change Sub-protocol
//!
//! This crate implements the view change of a PBFT-style replicated state
//! machine. When the current primary is suspected to be faulty or slow, a
//! quorum of replicas agrees on the next primary and rebuilds a single log of
//! in-flight batches without losing any batch a quorum had already prepared.
//!
//! ## Protocol Overview
//!
//! 1. A replica that wants to leave its view broadcasts a `ViewChange` vote
//!    carrying its stable checkpoint, checkpoint proofs and log.
//! 2. The primary of the target view waits for `n - f` votes and reconciles
//!    them into a `NewView` certificate: a checkpoint plus the gap-free run of
//!    batches above it.
//! 3. Every replica recomputes the certificate from the votes it references and
//!    broadcasts a `ViewChangeAck` for it when it matches.
//! 4. Once `n - f` matching acks are seen, the certificate is applied and
//!    ordering resumes in the new view.
//!
//! A view change that does not finish in time escalates to the next view with
//! an exponentially growing timeout.
//!
//! ## Implementation Structure
//!
//! Core Protocol Modules:
//! - `quorums.rs`: weak and strong quorum thresholds
//! - `types/`: batch ids, checkpoints and protocol messages
//! - `new_view_builder.rs`: checkpoint and batch reconciliation
//! - `replica_state.rs`: the view-related state of one replica
//! - `view_changer.rs`: the per-replica state machine
//! - `voting.rs`: per-view vote and ack tallies
//!
//! Supporting Modules:
//! - `crypto.rs`: digests of protocol objects
//! - `error.rs`: protocol errors
//! - `config.rs`: timeouts and monitor settings
//! - `monitor.rs`: throughput and latency tracking
//! - `invariants.rs`: invariant checking for replica state
//! - `format.rs`: string formatting for protocol structures
//! - `tracing_setup.rs`: structured logging with tracing-rs
//! - `sim/`: deterministic discrete-event simulator

// Core protocol modules
mod crypto;
mod error;
mod invariants;
mod new_view_builder;
mod quorums;
mod replica_state;
mod types;
mod view_changer;
mod voting;

// Public modules
pub mod config;
pub mod format;
pub mod monitor;
pub mod sim;
pub mod tracing_setup;

// Public re-exports
pub use config::{ConfigError, ViewChangeConfig};
pub use crypto::*;
pub use error::ViewChangeError;
pub use invariants::InvariantViolation;
pub use new_view_builder::NewViewBuilder;
pub use quorums::{Quorum, Quorums};
pub use replica_state::{OrderingSnapshot, ReplicaViewState};
pub use types::*;
pub use view_changer::{PendingNewView, Phase, ViewChanger};
pub use voting::{Duplicate, VoteTrack};
