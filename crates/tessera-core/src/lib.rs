//! # tessera-core
//!
//! Core library for tessera, a client that casts ticket-weighted votes on
//! off-chain governance proposals while spreading the submissions randomly
//! over the remaining voting window.
//!
//! The center of the crate is the [`engine::Trickler`]: it consumes a
//! pre-signed, pre-shuffled vote schedule, releases one vote per scheduled
//! offset, re-attempts transient failures with bounded backoff, and journals
//! every unit of work so a later [`verify`] pass can reconcile what this
//! client believes happened against the server's authoritative results.
//!
//! Supporting modules:
//!
//! - [`api`]: wire types for the governance server's JSON API
//! - [`client`]: HTTP client with retryable/terminal error classification
//! - [`schedule`]: randomized per-vote delay schedule over the vote window
//! - [`journal`]: append-only per-proposal work/success/failed streams
//! - [`verify`]: post-hoc reconciliation of journals against server results
//! - [`wallet`]: ticket eligibility filtering and vote signing via the wallet
//! - [`config`]: file- and flag-driven configuration

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod client;
pub mod config;
pub mod engine;
pub mod journal;
pub mod schedule;
pub mod verify;
pub mod wallet;

pub use client::{BallotSubmitter, ClientError, GovernanceClient, RetryError};
pub use config::Config;
pub use engine::{EngineError, Trickler};
pub use journal::Journal;
pub use schedule::{ScheduleError, VoteInterval};
