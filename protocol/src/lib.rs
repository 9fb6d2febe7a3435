// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ARBITER Protocol — Core Library
//!
//! The consensus core of ARBITER, a permissioned chain whose blocks are
//! agreed on by a fixed set of adjudicators. Each height is negotiated in a
//! sequence of phases. In every phase each adjudicator signs a contribution,
//! the contributions are gossiped until a majority holds the same set, and a
//! second exchange of signed set digests proves they really do.
//!
//! ## Architecture
//!
//! - **consensus** — Rounds, caches, heartbeats, gossip fill, the round
//!   coordinator and the long-running driver.
//! - **network** — Peer RPC traits and an in-process transport.
//! - **crypto** — Ed25519 keys, canonical digests and signed-message layouts.
//! - **node** — Wires one adjudicator identity into a runnable node.
//! - **config** — Protocol constants and timing defaults.
//!
//! ## Design Philosophy
//!
//! 1. A round either finalizes with a majority-agreed set or fails with a
//!    reason. It never panics and never finalizes on a minority.
//! 2. Everything that waits uses `tokio::time`, so the whole protocol runs
//!    under a paused clock in tests.
//! 3. Nothing unverified reaches a cache: membership and signature first,
//!    merge second.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;

pub use node::{AdjudicatorNode, NodeConfig, NodeError, NodeStatus};
