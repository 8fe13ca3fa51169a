//! Ethereum hashing and encoding primitives: keccak, EIP-55 checksums,
//! EIP-191 message hashing, EIP-712 typed-data hashing and legacy
//! transaction RLP.

use std::collections::{BTreeSet, HashMap};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// EIP-55 mixed-case checksum encoding of a 20-byte address.
pub fn to_checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = keccak256(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, ch) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Address of an uncompressed public key (64 bytes of x || y).
pub fn address_from_pubkey(pubkey: &[u8; 64]) -> [u8; 20] {
    let hash = keccak256(pubkey);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// EIP-191 personal-message digest:
/// `keccak("\x19Ethereum Signed Message:\n" + len + message)`.
pub fn hash_eip191_message(message: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(message.len() + 32);
    data.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    data.extend_from_slice(message.len().to_string().as_bytes());
    data.extend_from_slice(message);
    keccak256(&data)
}

pub fn parse_address(hex_addr: &str) -> anyhow::Result<[u8; 20]> {
    let stripped = hex_addr.strip_prefix("0x").unwrap_or(hex_addr);
    let bytes = hex::decode(stripped)?;
    let arr: [u8; 20] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("address must be 20 bytes, got {}", bytes.len()))?;
    Ok(arr)
}

/// Pre-EIP-1559 transaction. Quantities are big-endian minimal on the wire.
#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: BigUint,
    pub gas_limit: u64,
    pub to: Option<[u8; 20]>,
    pub value: BigUint,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

fn quantity_bytes(value: &BigUint) -> Vec<u8> {
    if value == &BigUint::from(0u8) {
        Vec::new()
    } else {
        value.to_bytes_be()
    }
}

fn u64_quantity(value: u64) -> Vec<u8> {
    quantity_bytes(&BigUint::from(value))
}

/// Strip leading zeros of a fixed-width big-endian quantity for RLP.
fn trimmed(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

impl LegacyTransaction {
    fn append_base_fields(&self, stream: &mut rlp::RlpStream) {
        stream.append(&u64_quantity(self.nonce));
        stream.append(&quantity_bytes(&self.gas_price));
        stream.append(&u64_quantity(self.gas_limit));
        match &self.to {
            Some(address) => stream.append(&address.to_vec()),
            None => stream.append_empty_data(),
        };
        stream.append(&quantity_bytes(&self.value));
        stream.append(&self.data);
    }

    /// EIP-155 signing digest: RLP of the nine fields with
    /// `(chain_id, 0, 0)` in the signature slots.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = rlp::RlpStream::new_list(9);
        self.append_base_fields(&mut stream);
        stream.append(&u64_quantity(self.chain_id));
        stream.append_empty_data();
        stream.append_empty_data();
        keccak256(&stream.out())
    }

    /// Serialized signed transaction with EIP-155 `v`.
    pub fn rlp_signed(&self, v: u64, r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
        let mut stream = rlp::RlpStream::new_list(9);
        self.append_base_fields(&mut stream);
        stream.append(&u64_quantity(v));
        stream.append(&trimmed(r));
        stream.append(&trimmed(s));
        stream.out().to_vec()
    }
}

/// EIP-712 domain. Only the populated fields enter the domain separator, in
/// canonical order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Domain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifying_contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eip712Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

pub type Eip712Types = HashMap<String, Vec<Eip712Field>>;

/// Full EIP-712 digest: `keccak(0x19 0x01 || domainSeparator ||
/// hashStruct(primaryType, message))`.
pub fn hash_typed_data(
    domain: &Eip712Domain,
    types: &Eip712Types,
    primary_type: &str,
    message: &Value,
) -> anyhow::Result<[u8; 32]> {
    let domain_separator = hash_domain(domain)?;
    let message_hash = hash_struct(types, primary_type, message)?;

    let mut data = Vec::with_capacity(66);
    data.extend_from_slice(&[0x19, 0x01]);
    data.extend_from_slice(&domain_separator);
    data.extend_from_slice(&message_hash);
    Ok(keccak256(&data))
}

fn hash_domain(domain: &Eip712Domain) -> anyhow::Result<[u8; 32]> {
    let mut fields: Vec<Eip712Field> = Vec::new();
    let mut value = serde_json::Map::new();
    if let Some(name) = &domain.name {
        fields.push(field("name", "string"));
        value.insert("name".into(), Value::String(name.clone()));
    }
    if let Some(version) = &domain.version {
        fields.push(field("version", "string"));
        value.insert("version".into(), Value::String(version.clone()));
    }
    if let Some(chain_id) = domain.chain_id {
        fields.push(field("chainId", "uint256"));
        value.insert("chainId".into(), Value::from(chain_id));
    }
    if let Some(contract) = &domain.verifying_contract {
        fields.push(field("verifyingContract", "address"));
        value.insert("verifyingContract".into(), Value::String(contract.clone()));
    }
    if let Some(salt) = &domain.salt {
        fields.push(field("salt", "bytes32"));
        value.insert("salt".into(), Value::String(salt.clone()));
    }

    let mut types = Eip712Types::new();
    types.insert("EIP712Domain".to_string(), fields);
    hash_struct(&types, "EIP712Domain", &Value::Object(value))
}

fn field(name: &str, field_type: &str) -> Eip712Field {
    Eip712Field {
        name: name.to_string(),
        field_type: field_type.to_string(),
    }
}

/// `keccak(typeHash || enc(field_1) || ... || enc(field_n))`.
fn hash_struct(types: &Eip712Types, type_name: &str, value: &Value) -> anyhow::Result<[u8; 32]> {
    let type_hash = keccak256(encode_type(types, type_name)?.as_bytes());
    let fields = types
        .get(type_name)
        .ok_or_else(|| anyhow::anyhow!("unknown EIP-712 type {type_name}"))?;

    let mut encoded = Vec::with_capacity(32 * (fields.len() + 1));
    encoded.extend_from_slice(&type_hash);
    for f in fields {
        let member = value
            .get(&f.name)
            .ok_or_else(|| anyhow::anyhow!("missing EIP-712 value for {}.{}", type_name, f.name))?;
        encoded.extend_from_slice(&encode_value(types, &f.field_type, member)?);
    }
    Ok(keccak256(&encoded))
}

/// `Type(field1 name1,...)` followed by referenced struct types sorted by
/// name.
fn encode_type(types: &Eip712Types, primary: &str) -> anyhow::Result<String> {
    let mut referenced = BTreeSet::new();
    collect_dependencies(types, primary, &mut referenced)?;
    referenced.remove(primary);

    let mut out = type_signature(types, primary)?;
    for name in referenced {
        out.push_str(&type_signature(types, &name)?);
    }
    Ok(out)
}

fn type_signature(types: &Eip712Types, name: &str) -> anyhow::Result<String> {
    let fields = types
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown EIP-712 type {name}"))?;
    let inner: Vec<String> = fields
        .iter()
        .map(|f| format!("{} {}", f.field_type, f.name))
        .collect();
    Ok(format!("{}({})", name, inner.join(",")))
}

fn collect_dependencies(
    types: &Eip712Types,
    name: &str,
    seen: &mut BTreeSet<String>,
) -> anyhow::Result<()> {
    if !seen.insert(name.to_string()) {
        return Ok(());
    }
    let fields = types
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown EIP-712 type {name}"))?;
    for f in fields {
        let base = base_type(&f.field_type);
        if types.contains_key(base) {
            collect_dependencies(types, base, seen)?;
        }
    }
    Ok(())
}

fn base_type(field_type: &str) -> &str {
    match field_type.find('[') {
        Some(idx) => &field_type[..idx],
        None => field_type,
    }
}

fn encode_value(types: &Eip712Types, field_type: &str, value: &Value) -> anyhow::Result<[u8; 32]> {
    // Arrays hash the concatenation of their encoded elements.
    if let Some(idx) = field_type.find('[') {
        let element_type = &field_type[..idx];
        let items = value
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("expected array for {field_type}"))?;
        let mut encoded = Vec::with_capacity(items.len() * 32);
        for item in items {
            encoded.extend_from_slice(&encode_value(types, element_type, item)?);
        }
        return Ok(keccak256(&encoded));
    }

    if types.contains_key(field_type) {
        return hash_struct(types, field_type, value);
    }

    match field_type {
        "address" => {
            let addr = parse_address(
                value
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("address must be a string"))?,
            )?;
            let mut out = [0u8; 32];
            out[12..].copy_from_slice(&addr);
            Ok(out)
        }
        "bool" => {
            let flag = value
                .as_bool()
                .ok_or_else(|| anyhow::anyhow!("bool expected"))?;
            let mut out = [0u8; 32];
            out[31] = flag as u8;
            Ok(out)
        }
        "string" => {
            let s = value
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("string expected"))?;
            Ok(keccak256(s.as_bytes()))
        }
        "bytes" => Ok(keccak256(&hex_bytes(value)?)),
        t if t.starts_with("bytes") => {
            let size: usize = t[5..]
                .parse()
                .map_err(|_| anyhow::anyhow!("bad fixed bytes type {t}"))?;
            let bytes = hex_bytes(value)?;
            if bytes.len() != size {
                anyhow::bail!("{t} expects {size} bytes, got {}", bytes.len());
            }
            let mut out = [0u8; 32];
            out[..size].copy_from_slice(&bytes);
            Ok(out)
        }
        t if t.starts_with("uint") => {
            let n = parse_uint(value)?;
            let bytes = n.to_bytes_be();
            if bytes.len() > 32 {
                anyhow::bail!("uint overflows 256 bits");
            }
            let mut out = [0u8; 32];
            out[32 - bytes.len()..].copy_from_slice(&bytes);
            Ok(out)
        }
        t if t.starts_with("int") => {
            let n: i128 = match value {
                Value::Number(num) => num
                    .as_i64()
                    .map(i128::from)
                    .ok_or_else(|| anyhow::anyhow!("int out of range"))?,
                Value::String(s) => s.parse()?,
                _ => anyhow::bail!("int expects number or string"),
            };
            let mut out = if n < 0 { [0xffu8; 32] } else { [0u8; 32] };
            out[16..].copy_from_slice(&n.to_be_bytes());
            Ok(out)
        }
        other => anyhow::bail!("unsupported EIP-712 type {other}"),
    }
}

fn hex_bytes(value: &Value) -> anyhow::Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("bytes value must be a hex string"))?;
    Ok(hex::decode(s.strip_prefix("0x").unwrap_or(s))?)
}

fn parse_uint(value: &Value) -> anyhow::Result<BigUint> {
    match value {
        Value::Number(num) => {
            let n = num
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("uint must be non-negative"))?;
            Ok(BigUint::from(n))
        }
        Value::String(s) => {
            if let Some(hexpart) = s.strip_prefix("0x") {
                Ok(BigUint::parse_bytes(hexpart.as_bytes(), 16)
                    .ok_or_else(|| anyhow::anyhow!("bad hex uint"))?)
            } else {
                Ok(s.parse()?)
            }
        }
        _ => anyhow::bail!("uint expects number or string"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keccak_empty_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn checksum_addresses_match_eip55_vectors() {
        let cases = [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ];
        for expected in cases {
            let raw = parse_address(expected).unwrap();
            assert_eq!(to_checksum_address(&raw), expected);
        }
    }

    #[test]
    fn eip191_prefix_includes_length() {
        // keccak("\x19Ethereum Signed Message:\n11Hello World")
        let digest = hash_eip191_message(b"Hello World");
        assert_eq!(
            hex::encode(digest),
            "a1de988600a42c4b4ab089b619297c17d53cffae5d5120d82d8a92d0bb3b78f2"
        );
    }

    #[test]
    fn legacy_tx_signing_hash_is_stable() {
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: BigUint::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: Some(parse_address("0x3535353535353535353535353535353535353535").unwrap()),
            value: BigUint::from(10u64).pow(18),
            data: Vec::new(),
            chain_id: 1,
        };
        // EIP-155 example transaction signing hash.
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn signed_tx_round_trips_through_rlp() {
        let tx = LegacyTransaction {
            nonce: 0,
            gas_price: BigUint::from(1_000_000_000u64),
            gas_limit: 21_000,
            to: Some(parse_address("0x3535353535353535353535353535353535353535").unwrap()),
            value: BigUint::from(0u8),
            data: vec![0xde, 0xad],
            chain_id: 42161,
        };
        let r = [0x11u8; 32];
        let s = [0x22u8; 32];
        let raw = tx.rlp_signed(42161 * 2 + 35, &r, &s);

        let decoded = rlp::Rlp::new(&raw);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);
        let v: u64 = decoded.val_at(6).unwrap();
        assert_eq!(v, 42161 * 2 + 35);
        let r_back: Vec<u8> = decoded.val_at(7).unwrap();
        assert_eq!(r_back, r.to_vec());
    }

    #[test]
    fn zero_quantities_encode_as_empty() {
        assert!(quantity_bytes(&BigUint::from(0u8)).is_empty());
        assert_eq!(trimmed(&[0, 0, 1, 2]), vec![1, 2]);
        assert!(trimmed(&[0, 0]).is_empty());
    }

    #[test]
    fn eip712_mail_vector() {
        // The canonical example from the EIP-712 spec.
        let mut types = Eip712Types::new();
        types.insert(
            "Person".into(),
            vec![field("name", "string"), field("wallet", "address")],
        );
        types.insert(
            "Mail".into(),
            vec![
                field("from", "Person"),
                field("to", "Person"),
                field("contents", "string"),
            ],
        );

        let encoded = encode_type(&types, "Mail").unwrap();
        assert_eq!(
            encoded,
            "Mail(Person from,Person to,string contents)Person(string name,address wallet)"
        );

        let domain = Eip712Domain {
            name: Some("Ether Mail".into()),
            version: Some("1".into()),
            chain_id: Some(1),
            verifying_contract: Some("0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC".into()),
            salt: None,
        };
        let message = json!({
            "from": {"name": "Cow", "wallet": "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826"},
            "to": {"name": "Bob", "wallet": "0xbBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB"},
            "contents": "Hello, Bob!"
        });

        let digest = hash_typed_data(&domain, &types, "Mail", &message).unwrap();
        assert_eq!(
            hex::encode(digest),
            "be609aee343fb3c4b28e1df9e632fca64fcfaede20f02e86244efddf30957bd2"
        );
    }

    #[test]
    fn eip712_rejects_unknown_type() {
        let types = Eip712Types::new();
        assert!(hash_struct(&types, "Nope", &json!({})).is_err());
    }

    #[test]
    fn eip712_uint_encodings() {
        let types = Eip712Types::new();
        let from_number = encode_value(&types, "uint256", &json!(42)).unwrap();
        let from_string = encode_value(&types, "uint256", &json!("42")).unwrap();
        let from_hex = encode_value(&types, "uint256", &json!("0x2a")).unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number, from_hex);
        assert_eq!(from_number[31], 42);
    }

    #[test]
    fn eip712_negative_int_is_twos_complement() {
        let types = Eip712Types::new();
        let encoded = encode_value(&types, "int256", &json!(-1)).unwrap();
        assert_eq!(encoded, [0xff; 32]);
    }
}
