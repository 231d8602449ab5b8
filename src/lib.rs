//! Pairwise relay round-trip-time measurement for onion-routed overlay
//! networks.
//!
//! Given two anchor relays W and Z and a set of candidate pairs (X, Y),
//! this crate measures the one-way-cancelled round trip between X and
//! Y by building three circuits through the overlay network
//! (`W-X-Y-Z`, `W-X-Z`, `W-Y-Z`), timing each with a tiny byte-exchange
//! protocol against a fixed echo target, and algebraically subtracting
//! the anchors' contribution: `xy_rtt = wxyz - 0.5*wxz - 0.5*wyz`.
//!
//! The crate ships two binaries. `ting-rtt` is the measurement engine:
//! it talks to one overlay daemon instance over its control and SOCKS5
//! ports and measures a set of pairs. `ting-dispatch` fans work out
//! across several engine instances, each pointed at its own daemon, and
//! folds their caches and result journals back together.

pub mod cache;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod log;
pub mod pairs;
pub mod results;
pub mod socks;
pub mod utils;
pub mod worker;
