use async_trait::async_trait;

/// Vendor-neutral HSM contract. AWS KMS, CloudHSM and friends all expose the
/// same two primitives: an SPKI-encoded EC public key and raw ECDSA signing
/// of a 32-byte digest, DER-encoded on the way back.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// SubjectPublicKeyInfo DER bytes for the key.
    async fn get_public_key(&self, key_id: &str) -> anyhow::Result<Vec<u8>>;

    /// DER-encoded ECDSA signature (r, s) over `digest`.
    async fn sign(&self, key_id: &str, digest: &[u8; 32]) -> anyhow::Result<Vec<u8>>;
}

/// Resolve the signing key for a chain: `KMS_KEY_ID_<CHAIN>` wins, the
/// generic `KMS_KEY_ID` is the fallback, neither means signing is off.
pub fn key_id_for_chain(chain: &str) -> Option<String> {
    let per_chain = format!("KMS_KEY_ID_{}", chain.to_ascii_uppercase());
    std::env::var(per_chain)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("KMS_KEY_ID")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}
