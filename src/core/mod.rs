//! Core chain data structures and signing.
//!
//! - `Transaction`: signed wire transaction with cached identity data
//! - `Signer`: chain-bound signing hash and sender recovery
//! - `Block`/`Header`: the slice of chain data the pool consumes
//! - `chain`: collaborator traits implemented by the embedding node

pub mod block;
pub mod chain;
pub mod signer;
pub mod transaction;
