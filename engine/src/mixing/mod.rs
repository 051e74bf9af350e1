//! The mixing pipeline: per-session state, escrow precomputation, the
//! deposit commitment phase, the layered shuffle, and threshold signing of
//! the disbursement transactions.

pub mod escrow;
pub mod input_peers;
pub mod session;
pub mod shuffle;
pub mod signing;
pub mod strategies;
