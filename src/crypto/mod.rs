//! Cryptographic primitives: secp256k1 key pairs and address recovery.

pub mod key_pair;
