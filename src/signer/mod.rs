//! HSM-backed Ethereum signing. The `KmsClient` trait is the vendor seam;
//! everything address- and signature-shaped happens on this side of it.

pub mod eth;
mod kms;
mod signer;

pub use kms::{key_id_for_chain, KmsClient};
pub use signer::{KmsSigner, KmsSignerConfig, Signature65, SignerError};
