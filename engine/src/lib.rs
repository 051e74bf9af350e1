//! CoinParty mixing peer engine: a fixed committee of peers jointly holds
//! escrow keys via threshold cryptography, shuffles the mapping from
//! deposits to fresh output addresses under a verifiable checksum chain,
//! and cooperatively signs the disbursement transactions.

pub mod btc;
pub mod errors;
pub mod mixing;
pub mod settings;
pub mod web;

#[cfg(test)]
pub(crate) mod test_utils;
