use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::models::now_ms;

use super::eth::{
    address_from_pubkey, hash_eip191_message, hash_typed_data, to_checksum_address, Eip712Domain,
    Eip712Types, LegacyTransaction,
};
use super::kms::KmsClient;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("ERR_KMS_CIRCUIT_OPEN: signer circuit is open")]
    CircuitOpen,
    #[error("ERR_KMS_QUEUE_FULL: sign queue is full")]
    QueueFull,
    #[error("ERR_KMS_TIMEOUT: KMS sign timed out")]
    Timeout,
    #[error("ERR_KMS_DRAINING: signer is draining")]
    Draining,
    #[error("ERR_KMS_RECOVERY: no recovery id reproduces the signer address")]
    Recovery,
    #[error("KMS transport error: {0}")]
    Kms(String),
    #[error("invalid DER signature: {0}")]
    Der(String),
    #[error("invalid SPKI public key: {0}")]
    Spki(String),
}

/// An Ethereum signature with its recovery id in legacy 27/28 form.
#[derive(Debug, Clone, Copy)]
pub struct Signature65 {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u64,
}

#[derive(Debug, Clone)]
pub struct KmsSignerConfig {
    pub key_id: String,
    pub max_concurrent_signs: usize,
    pub max_sign_queue_size: usize,
    pub kms_timeout_ms: u64,
    pub failure_threshold: u32,
    pub circuit_cooldown_ms: i64,
}

impl KmsSignerConfig {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            max_concurrent_signs: 3,
            max_sign_queue_size: 100,
            kms_timeout_ms: 5_000,
            failure_threshold: 5,
            circuit_cooldown_ms: 300_000,
        }
    }
}

struct GateInner {
    available: usize,
    queue: VecDeque<oneshot::Sender<Result<(), SignerError>>>,
    max_queue: usize,
    draining: bool,
}

/// Bounded concurrency gate: up to N concurrent signs, a capped FIFO queue
/// behind them, and a drain switch that flushes waiters.
struct SignGate {
    inner: Mutex<GateInner>,
}

impl SignGate {
    fn new(concurrency: usize, max_queue: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                available: concurrency,
                queue: VecDeque::new(),
                max_queue,
                draining: false,
            }),
        }
    }

    async fn acquire(self: &Arc<Self>) -> Result<GatePermit, SignerError> {
        let rx = {
            let mut gate = self.inner.lock();
            if gate.draining {
                return Err(SignerError::Draining);
            }
            if gate.available > 0 {
                gate.available -= 1;
                return Ok(GatePermit {
                    gate: Arc::clone(self),
                });
            }
            if gate.queue.len() >= gate.max_queue {
                return Err(SignerError::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            gate.queue.push_back(tx);
            rx
        };
        match rx.await {
            Ok(Ok(())) => Ok(GatePermit {
                gate: Arc::clone(self),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SignerError::Draining),
        }
    }

    /// Hand the slot straight to the next live waiter; only grow the pool
    /// when nobody is waiting.
    fn release(&self) {
        let mut gate = self.inner.lock();
        while let Some(tx) = gate.queue.pop_front() {
            if tx.send(Ok(())).is_ok() {
                return;
            }
            // Waiter cancelled; try the next one.
        }
        gate.available += 1;
    }

    fn drain(&self) {
        let mut gate = self.inner.lock();
        gate.draining = true;
        for tx in gate.queue.drain(..) {
            let _ = tx.send(Err(SignerError::Draining));
        }
    }
}

struct GatePermit {
    gate: Arc<SignGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[derive(Default)]
struct FailureState {
    consecutive_failures: u32,
    circuit_open_until: i64,
}

/// HSM-backed Ethereum signer. The private key never leaves the HSM; this
/// side derives the address from the SPKI public key, normalizes DER
/// signatures into low-s `(r, s, v)` form, and guards the HSM with a
/// concurrency gate, timeout, and failure circuit.
pub struct KmsSigner {
    kms: Arc<dyn KmsClient>,
    config: KmsSignerConfig,
    address: tokio::sync::OnceCell<String>,
    gate: Arc<SignGate>,
    state: Mutex<FailureState>,
    draining: AtomicBool,
}

impl KmsSigner {
    pub fn new(kms: Arc<dyn KmsClient>, config: KmsSignerConfig) -> Self {
        let gate = Arc::new(SignGate::new(
            config.max_concurrent_signs,
            config.max_sign_queue_size,
        ));
        Self {
            kms,
            config,
            address: tokio::sync::OnceCell::new(),
            gate,
            state: Mutex::new(FailureState::default()),
            draining: AtomicBool::new(false),
        }
    }

    /// Per-chain factory honoring `KMS_KEY_ID_<CHAIN>` with the generic
    /// `KMS_KEY_ID` fallback. No key configured means no signer.
    pub fn for_chain(kms: Arc<dyn KmsClient>, chain: &str) -> Option<Self> {
        let key_id = super::kms::key_id_for_chain(chain)?;
        Some(Self::new(kms, KmsSignerConfig::new(key_id)))
    }

    /// EIP-55 address of the HSM key. Cached; concurrent first calls share
    /// one KMS round trip.
    pub async fn get_address(&self) -> Result<String, SignerError> {
        self.address
            .get_or_try_init(|| async {
                let spki = self
                    .kms
                    .get_public_key(&self.config.key_id)
                    .await
                    .map_err(|e| SignerError::Kms(e.to_string()))?;
                let pubkey = parse_spki_public_key(&spki)?;
                Ok(to_checksum_address(&address_from_pubkey(&pubkey)))
            })
            .await
            .cloned()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.state.lock().circuit_open_until > now_ms()
    }

    /// Sign a 32-byte digest, returning a recoverable low-s signature.
    pub async fn sign(&self, digest: &[u8; 32]) -> Result<Signature65, SignerError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(SignerError::Draining);
        }
        if self.is_circuit_open() {
            return Err(SignerError::CircuitOpen);
        }

        let _permit = self.gate.acquire().await?;
        if self.draining.load(Ordering::Acquire) {
            return Err(SignerError::Draining);
        }

        match self.sign_inner(digest).await {
            Ok(signature) => {
                self.state.lock().consecutive_failures = 0;
                Ok(signature)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.circuit_open_until = now_ms() + self.config.circuit_cooldown_ms;
                    warn!(
                        failures = state.consecutive_failures,
                        cooldown_ms = self.config.circuit_cooldown_ms,
                        "KMS circuit opened"
                    );
                }
                Err(e)
            }
        }
    }

    async fn sign_inner(&self, digest: &[u8; 32]) -> Result<Signature65, SignerError> {
        let address = self.get_address().await?;

        let der = tokio::time::timeout(
            Duration::from_millis(self.config.kms_timeout_ms),
            self.kms.sign(&self.config.key_id, digest),
        )
        .await
        .map_err(|_| SignerError::Timeout)?
        .map_err(|e| SignerError::Kms(e.to_string()))?;

        let (r, s) = parse_der_signature(&der)?;
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&r);
        raw[32..].copy_from_slice(&s);
        let signature =
            Signature::from_slice(&raw).map_err(|e| SignerError::Der(e.to_string()))?;

        // EIP-2: fold s into the lower half of the curve order.
        let signature = signature.normalize_s().unwrap_or(signature);
        let r: [u8; 32] = signature.r().to_bytes().into();
        let s: [u8; 32] = signature.s().to_bytes().into();

        for v in [27u64, 28] {
            let recovery_id = RecoveryId::try_from((v - 27) as u8)
                .map_err(|e| SignerError::Der(e.to_string()))?;
            let Ok(recovered) = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            else {
                continue;
            };
            if verifying_key_address(&recovered) == address {
                return Ok(Signature65 { r, s, v });
            }
        }
        Err(SignerError::Recovery)
    }

    /// Sign a legacy transaction and return the raw EIP-155 encoding.
    pub async fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>, SignerError> {
        let digest = tx.signing_hash();
        let signature = self.sign(&digest).await?;
        let v = tx.chain_id * 2 + 35 + (signature.v - 27);
        Ok(tx.rlp_signed(v, &signature.r, &signature.s))
    }

    /// EIP-191 personal message signature.
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature65, SignerError> {
        let digest = hash_eip191_message(message);
        self.sign(&digest).await
    }

    /// EIP-712 typed-data signature.
    pub async fn sign_typed_data(
        &self,
        domain: &Eip712Domain,
        types: &Eip712Types,
        primary_type: &str,
        message: &Value,
    ) -> Result<Signature65, SignerError> {
        let digest = hash_typed_data(domain, types, primary_type, message)
            .map_err(|e| SignerError::Der(e.to_string()))?;
        self.sign(&digest).await
    }

    /// Refuse new work and flush queued waiters. In-flight signs finish.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        self.gate.drain();
        debug!("KMS signer draining");
    }
}

fn verifying_key_address(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let mut pubkey = [0u8; 64];
    pubkey.copy_from_slice(&point.as_bytes()[1..65]);
    to_checksum_address(&address_from_pubkey(&pubkey))
}

/// Read one TLV header, returning (tag, content start, content length).
fn read_tlv(buf: &[u8], pos: usize) -> Result<(u8, usize, usize), SignerError> {
    let err = |msg: &str| SignerError::Spki(msg.to_string());
    if pos + 2 > buf.len() {
        return Err(err("truncated TLV header"));
    }
    let tag = buf[pos];
    let first = buf[pos + 1];
    if first < 0x80 {
        Ok((tag, pos + 2, first as usize))
    } else {
        let len_bytes = (first & 0x7f) as usize;
        if len_bytes == 0 || len_bytes > 2 || pos + 2 + len_bytes > buf.len() {
            return Err(err("unsupported TLV length"));
        }
        let mut length = 0usize;
        for i in 0..len_bytes {
            length = (length << 8) | buf[pos + 2 + i] as usize;
        }
        Ok((tag, pos + 2 + len_bytes, length))
    }
}

/// Walk a SubjectPublicKeyInfo: outer SEQUENCE, AlgorithmIdentifier SEQUENCE
/// (skipped), then the BIT STRING holding an uncompressed EC point.
fn parse_spki_public_key(spki: &[u8]) -> Result<[u8; 64], SignerError> {
    let err = |msg: &str| SignerError::Spki(msg.to_string());

    let (tag, body_start, body_len) = read_tlv(spki, 0)?;
    if tag != 0x30 {
        return Err(err("expected outer SEQUENCE"));
    }
    if body_start + body_len > spki.len() {
        return Err(err("outer SEQUENCE overruns buffer"));
    }

    let (alg_tag, alg_start, alg_len) = read_tlv(spki, body_start)?;
    if alg_tag != 0x30 {
        return Err(err("expected AlgorithmIdentifier SEQUENCE"));
    }

    let (bits_tag, bits_start, bits_len) = read_tlv(spki, alg_start + alg_len)?;
    if bits_tag != 0x03 {
        return Err(err("expected BIT STRING"));
    }
    if bits_start + bits_len > spki.len() {
        return Err(err("BIT STRING overruns buffer"));
    }
    let bits = &spki[bits_start..bits_start + bits_len];
    if bits.len() != 66 {
        return Err(err("unexpected BIT STRING length"));
    }
    if bits[0] != 0x00 {
        return Err(err("nonzero unused-bits byte"));
    }
    if bits[1] != 0x04 {
        return Err(err("public key is not an uncompressed point"));
    }

    let mut pubkey = [0u8; 64];
    pubkey.copy_from_slice(&bits[2..66]);
    Ok(pubkey)
}

/// Parse a DER ECDSA signature into fixed 32-byte (r, s).
fn parse_der_signature(der: &[u8]) -> Result<([u8; 32], [u8; 32]), SignerError> {
    let err = |msg: &str| SignerError::Der(msg.to_string());

    let (tag, body_start, body_len) = read_tlv(der, 0).map_err(|_| err("truncated signature"))?;
    if tag != 0x30 {
        return Err(err("expected SEQUENCE"));
    }
    if body_start + body_len != der.len() {
        return Err(err("signature length mismatch"));
    }

    let mut pos = body_start;
    let r = read_der_integer(der, &mut pos)?;
    let s = read_der_integer(der, &mut pos)?;
    if pos != der.len() {
        return Err(err("trailing bytes after signature"));
    }
    Ok((r, s))
}

fn read_der_integer(der: &[u8], pos: &mut usize) -> Result<[u8; 32], SignerError> {
    let err = |msg: &str| SignerError::Der(msg.to_string());

    let (tag, start, len) = read_tlv(der, *pos).map_err(|_| err("truncated INTEGER"))?;
    if tag != 0x02 {
        return Err(err("expected INTEGER"));
    }
    if len == 0 || start + len > der.len() {
        return Err(err("bad INTEGER length"));
    }
    let mut bytes = &der[start..start + len];
    // A leading zero marks a positive value whose high bit is set.
    if bytes.len() == 33 {
        if bytes[0] != 0x00 {
            return Err(err("INTEGER too large for a field element"));
        }
        bytes = &bytes[1..];
    }
    if bytes.len() > 32 {
        return Err(err("INTEGER too large for a field element"));
    }

    *pos = start + len;
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::SigningKey;
    use std::sync::atomic::AtomicU32;

    /// Local secp256k1 key wearing an HSM costume.
    struct LocalKms {
        key: SigningKey,
        sign_calls: AtomicU32,
        delay_ms: u64,
    }

    impl LocalKms {
        fn new() -> Arc<Self> {
            Self::with_delay(0)
        }

        fn with_delay(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                key: SigningKey::from_slice(&[0x42u8; 32]).unwrap(),
                sign_calls: AtomicU32::new(0),
                delay_ms,
            })
        }

        fn spki(&self) -> Vec<u8> {
            let point = self.key.verifying_key().to_encoded_point(false);
            let mut spki = Vec::with_capacity(88);
            spki.extend_from_slice(&[0x30, 0x56]);
            // AlgorithmIdentifier: ecPublicKey + secp256k1.
            spki.extend_from_slice(&[
                0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
                0x2b, 0x81, 0x04, 0x00, 0x0a,
            ]);
            spki.extend_from_slice(&[0x03, 0x42, 0x00]);
            spki.extend_from_slice(point.as_bytes());
            spki
        }

        fn expected_address(&self) -> String {
            verifying_key_address(self.key.verifying_key())
        }
    }

    #[async_trait]
    impl KmsClient for LocalKms {
        async fn get_public_key(&self, _key_id: &str) -> anyhow::Result<Vec<u8>> {
            Ok(self.spki())
        }

        async fn sign(&self, _key_id: &str, digest: &[u8; 32]) -> anyhow::Result<Vec<u8>> {
            self.sign_calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let signature: Signature = self.key.sign_prehash(digest)?;
            Ok(signature.to_der().as_bytes().to_vec())
        }
    }

    fn signer_with(kms: Arc<LocalKms>) -> KmsSigner {
        KmsSigner::new(kms, KmsSignerConfig::new("test-key"))
    }

    #[tokio::test]
    async fn address_derivation_matches_key() {
        let kms = LocalKms::new();
        let signer = signer_with(kms.clone());
        let address = signer.get_address().await.unwrap();
        assert_eq!(address, kms.expected_address());
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
    }

    #[tokio::test]
    async fn signature_recovers_to_address_with_low_s() {
        let kms = LocalKms::new();
        let signer = signer_with(kms.clone());
        let address = signer.get_address().await.unwrap();

        for seed in 0u8..5 {
            let digest = super::super::eth::keccak256(&[seed; 16]);
            let signature = signer.sign(&digest).await.unwrap();
            assert!(signature.v == 27 || signature.v == 28);

            let mut raw = [0u8; 64];
            raw[..32].copy_from_slice(&signature.r);
            raw[32..].copy_from_slice(&signature.s);
            let parsed = Signature::from_slice(&raw).unwrap();
            assert!(parsed.normalize_s().is_none(), "s must already be low");

            let recovery_id = RecoveryId::try_from((signature.v - 27) as u8).unwrap();
            let recovered =
                VerifyingKey::recover_from_prehash(&digest, &parsed, recovery_id).unwrap();
            assert_eq!(verifying_key_address(&recovered), address);
        }
    }

    #[tokio::test]
    async fn timeout_trips_circuit_after_threshold() {
        let kms = LocalKms::with_delay(60_000);
        let mut config = KmsSignerConfig::new("test-key");
        config.kms_timeout_ms = 50;
        let signer = KmsSigner::new(kms.clone(), config);
        let digest = [7u8; 32];

        for _ in 0..5 {
            let err = signer.sign(&digest).await.unwrap_err();
            assert!(matches!(err, SignerError::Timeout));
        }
        // Sixth call fast-fails without touching the HSM again.
        let err = signer.sign(&digest).await.unwrap_err();
        assert!(matches!(err, SignerError::CircuitOpen));
        assert_eq!(kms.sign_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let kms = LocalKms::new();
        let signer = signer_with(kms);
        signer.state.lock().consecutive_failures = 4;
        signer.sign(&[1u8; 32]).await.unwrap();
        assert_eq!(signer.state.lock().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn queue_overflow_rejects() {
        let kms = LocalKms::with_delay(200);
        let mut config = KmsSignerConfig::new("test-key");
        config.max_concurrent_signs = 1;
        config.max_sign_queue_size = 1;
        let signer = Arc::new(KmsSigner::new(kms, config));
        // Prime the address cache so sign calls contend only on the gate.
        signer.get_address().await.unwrap();

        let first = {
            let s = Arc::clone(&signer);
            tokio::spawn(async move { s.sign(&[1u8; 32]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let s = Arc::clone(&signer);
            tokio::spawn(async move { s.sign(&[2u8; 32]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Slot busy, queue full: the third caller bounces immediately.
        let err = signer.sign(&[3u8; 32]).await.unwrap_err();
        assert!(matches!(err, SignerError::QueueFull));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn drain_flushes_waiters_and_blocks_new_work() {
        let kms = LocalKms::with_delay(200);
        let mut config = KmsSignerConfig::new("test-key");
        config.max_concurrent_signs = 1;
        let signer = Arc::new(KmsSigner::new(kms, config));
        signer.get_address().await.unwrap();

        let in_flight = {
            let s = Arc::clone(&signer);
            tokio::spawn(async move { s.sign(&[1u8; 32]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = {
            let s = Arc::clone(&signer);
            tokio::spawn(async move { s.sign(&[2u8; 32]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        signer.drain();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, SignerError::Draining));
        let err = signer.sign(&[3u8; 32]).await.unwrap_err();
        assert!(matches!(err, SignerError::Draining));
        // The sign already in flight completes.
        assert!(in_flight.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn sign_transaction_produces_decodable_rlp() {
        use num_bigint::BigUint;

        let kms = LocalKms::new();
        let signer = signer_with(kms);
        let tx = LegacyTransaction {
            nonce: 1,
            gas_price: BigUint::from(30_000_000_000u64),
            gas_limit: 60_000,
            to: Some(super::super::eth::parse_address(
                "0x3535353535353535353535353535353535353535",
            )
            .unwrap()),
            value: BigUint::from(0u8),
            data: vec![0xa9, 0x05, 0x9c, 0xbb],
            chain_id: 1,
        };

        let raw = signer.sign_transaction(&tx).await.unwrap();
        let decoded = rlp::Rlp::new(&raw);
        assert_eq!(decoded.item_count().unwrap(), 9);
        let v: u64 = decoded.val_at(6).unwrap();
        assert!(v == 37 || v == 38);
    }

    #[tokio::test]
    async fn sign_message_recovers_via_eip191_digest() {
        let kms = LocalKms::new();
        let signer = signer_with(kms);
        let address = signer.get_address().await.unwrap();

        let signature = signer.sign_message(b"gm").await.unwrap();
        let digest = hash_eip191_message(b"gm");
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&signature.r);
        raw[32..].copy_from_slice(&signature.s);
        let parsed = Signature::from_slice(&raw).unwrap();
        let recovery_id = RecoveryId::try_from((signature.v - 27) as u8).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(&digest, &parsed, recovery_id).unwrap();
        assert_eq!(verifying_key_address(&recovered), address);
    }

    #[tokio::test]
    async fn sign_typed_data_signs_the_eip712_digest() {
        let kms = LocalKms::new();
        let signer = signer_with(kms);

        let domain = Eip712Domain {
            name: Some("Bridge".into()),
            version: Some("1".into()),
            chain_id: Some(1),
            verifying_contract: Some("0x3535353535353535353535353535353535353535".into()),
            salt: None,
        };
        let mut types = Eip712Types::new();
        types.insert(
            "Transfer".into(),
            vec![
                super::super::eth::Eip712Field {
                    name: "amount".into(),
                    field_type: "uint256".into(),
                },
                super::super::eth::Eip712Field {
                    name: "recipient".into(),
                    field_type: "address".into(),
                },
            ],
        );
        let message = serde_json::json!({
            "amount": "1000000000000000000",
            "recipient": "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826"
        });

        let signature = signer
            .sign_typed_data(&domain, &types, "Transfer", &message)
            .await
            .unwrap();
        assert!(signature.v == 27 || signature.v == 28);
    }

    #[test]
    fn spki_parse_rejects_malformed_keys() {
        assert!(matches!(
            parse_spki_public_key(&[0x30, 0x02, 0x01, 0x00]),
            Err(SignerError::Spki(_))
        ));
        // Valid shape, wrong unused-bits byte.
        let kms_key = SigningKey::from_slice(&[0x42u8; 32]).unwrap();
        let point = kms_key.verifying_key().to_encoded_point(false);
        let mut spki = Vec::new();
        spki.extend_from_slice(&[0x30, 0x56]);
        spki.extend_from_slice(&[
            0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
            0x81, 0x04, 0x00, 0x0a,
        ]);
        spki.extend_from_slice(&[0x03, 0x42, 0x01]);
        spki.extend_from_slice(point.as_bytes());
        assert!(matches!(
            parse_spki_public_key(&spki),
            Err(SignerError::Spki(_))
        ));
    }

    #[test]
    fn der_parse_rejects_malformed_signatures() {
        // Mis-tagged outer element.
        assert!(parse_der_signature(&[0x31, 0x00]).is_err());
        // Truncated INTEGER body.
        assert!(parse_der_signature(&[0x30, 0x04, 0x02, 0x05, 0x01, 0x02]).is_err());
        // Oversized INTEGER (34 bytes).
        let mut oversized = vec![0x30, 0x27, 0x02, 0x22];
        oversized.extend_from_slice(&[0x01; 34]);
        oversized.extend_from_slice(&[0x02, 0x01, 0x01]);
        assert!(parse_der_signature(&oversized).is_err());
    }

    #[test]
    fn der_parse_strips_leading_zero() {
        // r = 33 bytes with leading zero (high bit set), s = 1 byte.
        let mut der = vec![0x30, 0x26, 0x02, 0x21, 0x00];
        der.push(0x80);
        der.extend_from_slice(&[0xaa; 31]);
        der.extend_from_slice(&[0x02, 0x01, 0x07]);
        let (r, s) = parse_der_signature(&der).unwrap();
        assert_eq!(r[0], 0x80);
        assert_eq!(r[31], 0xaa);
        assert_eq!(s[31], 0x07);
        assert_eq!(s[..31], [0u8; 31]);
    }
}
