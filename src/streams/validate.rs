use serde_json::Value;

use crate::models::{PendingOpportunity, PriceUpdate, WhaleTransaction};

/// Ceiling for a single whale transaction; anything above is garbage data.
pub const MAX_WHALE_USD: f64 = 1e11;

/// Mempool intents may not promise more than 50% slippage.
pub const MAX_SLIPPAGE: f64 = 0.5;

/// Why a stream message was discarded. Discards are logged and acked, never
/// retried: replaying a malformed message can only fail the same way again.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("not a decodable message: {0}")]
    Malformed(String),
    #[error("field {0} is empty")]
    Empty(&'static str),
    #[error("field {0} is not finite")]
    NotFinite(&'static str),
    #[error("field {field} out of bounds: {value}")]
    OutOfBounds { field: &'static str, value: f64 },
    #[error("field {0} is not an unsigned decimal string")]
    NotNumericString(&'static str),
    #[error("swap path has {0} hops, need at least 2")]
    PathTooShort(usize),
    #[error("timestamp must be positive, got {0}")]
    BadTimestamp(i64),
    #[error("chainId must be positive")]
    BadChainId,
    #[error("deadline must be positive")]
    BadDeadline,
}

fn require_nonempty(value: &str, field: &'static str) -> Result<(), RejectReason> {
    if value.trim().is_empty() {
        Err(RejectReason::Empty(field))
    } else {
        Ok(())
    }
}

fn require_finite(value: f64, field: &'static str) -> Result<(), RejectReason> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RejectReason::NotFinite(field))
    }
}

/// `^\d+$` without pulling in a regex engine for three fields.
fn is_numeric_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Validate a raw price message. Bounds are exclusive on both ends.
pub fn validate_price(
    raw: &Value,
    min_valid_price: f64,
    max_valid_price: f64,
) -> Result<PriceUpdate, RejectReason> {
    let update: PriceUpdate =
        serde_json::from_value(raw.clone()).map_err(|e| RejectReason::Malformed(e.to_string()))?;

    require_nonempty(&update.chain, "chain")?;
    require_nonempty(&update.dex, "dex")?;
    require_nonempty(&update.pair_key, "pairKey")?;
    require_finite(update.price, "price")?;
    if update.price <= min_valid_price || update.price >= max_valid_price {
        return Err(RejectReason::OutOfBounds {
            field: "price",
            value: update.price,
        });
    }
    if update.timestamp <= 0 {
        return Err(RejectReason::BadTimestamp(update.timestamp));
    }
    Ok(update)
}

/// Validate a raw whale alert.
pub fn validate_whale(raw: &Value) -> Result<WhaleTransaction, RejectReason> {
    let tx: WhaleTransaction =
        serde_json::from_value(raw.clone()).map_err(|e| RejectReason::Malformed(e.to_string()))?;

    require_finite(tx.usd_value, "usdValue")?;
    if !(0.0..=MAX_WHALE_USD).contains(&tx.usd_value) {
        return Err(RejectReason::OutOfBounds {
            field: "usdValue",
            value: tx.usd_value,
        });
    }
    require_finite(tx.amount, "amount")?;
    if tx.amount <= 0.0 {
        return Err(RejectReason::OutOfBounds {
            field: "amount",
            value: tx.amount,
        });
    }
    require_nonempty(&tx.token, "token")?;
    require_nonempty(&tx.transaction_hash, "transactionHash")?;
    if tx.timestamp <= 0 {
        return Err(RejectReason::BadTimestamp(tx.timestamp));
    }
    Ok(tx)
}

/// Validate a raw pending-opportunity message and its embedded intent.
pub fn validate_pending(raw: &Value) -> Result<PendingOpportunity, RejectReason> {
    let pending: PendingOpportunity =
        serde_json::from_value(raw.clone()).map_err(|e| RejectReason::Malformed(e.to_string()))?;

    require_nonempty(&pending.kind, "type")?;

    let intent = &pending.intent;
    require_nonempty(&intent.hash, "intent.hash")?;
    require_nonempty(&intent.router, "intent.router")?;
    require_nonempty(&intent.intent_type, "intent.type")?;
    require_nonempty(&intent.token_in, "intent.tokenIn")?;
    require_nonempty(&intent.token_out, "intent.tokenOut")?;
    require_nonempty(&intent.sender, "intent.sender")?;
    if intent.chain_id == 0 {
        return Err(RejectReason::BadChainId);
    }
    if intent.deadline <= 0 {
        return Err(RejectReason::BadDeadline);
    }
    require_finite(intent.slippage_tolerance, "intent.slippageTolerance")?;
    if !(0.0..=MAX_SLIPPAGE).contains(&intent.slippage_tolerance) {
        return Err(RejectReason::OutOfBounds {
            field: "intent.slippageTolerance",
            value: intent.slippage_tolerance,
        });
    }
    if !is_numeric_string(&intent.gas_price) {
        return Err(RejectReason::NotNumericString("intent.gasPrice"));
    }
    if !is_numeric_string(&intent.amount_in) {
        return Err(RejectReason::NotNumericString("intent.amountIn"));
    }
    if !is_numeric_string(&intent.expected_amount_out) {
        return Err(RejectReason::NotNumericString("intent.expectedAmountOut"));
    }
    if intent.path.len() < 2 {
        return Err(RejectReason::PathTooShort(intent.path.len()));
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn price_json() -> Value {
        json!({
            "chain": "ethereum",
            "dex": "uniswap",
            "pairKey": "WETH_USDC",
            "token0": "WETH",
            "token1": "USDC",
            "price": 2500.0,
            "timestamp": 1_700_000_000_000i64
        })
    }

    #[test]
    fn valid_price_passes() {
        let update = validate_price(&price_json(), 1e-12, 1e12).unwrap();
        assert_eq!(update.price, 2500.0);
    }

    #[test]
    fn price_bounds_are_exclusive() {
        let mut raw = price_json();
        raw["price"] = json!(1e12);
        assert!(matches!(
            validate_price(&raw, 1e-12, 1e12),
            Err(RejectReason::OutOfBounds { field: "price", .. })
        ));

        raw["price"] = json!(1e-12);
        assert!(validate_price(&raw, 1e-12, 1e12).is_err());
    }

    #[test]
    fn empty_chain_rejected() {
        let mut raw = price_json();
        raw["chain"] = json!("  ");
        assert_eq!(
            validate_price(&raw, 1e-12, 1e12).unwrap_err(),
            RejectReason::Empty("chain")
        );
    }

    #[test]
    fn zero_timestamp_rejected() {
        let mut raw = price_json();
        raw["timestamp"] = json!(0);
        assert_eq!(
            validate_price(&raw, 1e-12, 1e12).unwrap_err(),
            RejectReason::BadTimestamp(0)
        );
    }

    fn whale_json() -> Value {
        json!({
            "chain": "ethereum",
            "token": "WETH",
            "direction": "buy",
            "usdValue": 2_000_000.0,
            "amount": 800.0,
            "address": "0xwhale",
            "transactionHash": "0xhash",
            "timestamp": 1_700_000_000_000i64
        })
    }

    #[test]
    fn valid_whale_passes() {
        assert!(validate_whale(&whale_json()).is_ok());
    }

    #[test]
    fn whale_usd_cap() {
        let mut raw = whale_json();
        raw["usdValue"] = json!(2e11);
        assert!(matches!(
            validate_whale(&raw),
            Err(RejectReason::OutOfBounds { field: "usdValue", .. })
        ));
    }

    #[test]
    fn whale_bad_direction_is_malformed() {
        let mut raw = whale_json();
        raw["direction"] = json!("hodl");
        assert!(matches!(
            validate_whale(&raw),
            Err(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn whale_nonpositive_amount_rejected() {
        let mut raw = whale_json();
        raw["amount"] = json!(0.0);
        assert!(validate_whale(&raw).is_err());
    }

    fn pending_json() -> Value {
        json!({
            "type": "pending",
            "publishedAt": 1_700_000_000_000i64,
            "intent": {
                "hash": "0xabc",
                "router": "0xrouter",
                "type": "swapExactTokensForTokens",
                "tokenIn": "WETH",
                "tokenOut": "USDC",
                "sender": "0xsender",
                "chainId": 1,
                "deadline": 1_700_000_600i64,
                "nonce": 7,
                "slippageTolerance": 0.01,
                "gasPrice": "32000000000",
                "amountIn": "1000000000000000000",
                "expectedAmountOut": "2500000000",
                "path": ["WETH", "USDC"],
                "firstSeen": 1_700_000_000_000i64
            }
        })
    }

    #[test]
    fn valid_pending_passes() {
        assert!(validate_pending(&pending_json()).is_ok());
    }

    #[test]
    fn pending_rejects_signed_amount() {
        let mut raw = pending_json();
        raw["intent"]["amountIn"] = json!("-5");
        assert_eq!(
            validate_pending(&raw).unwrap_err(),
            RejectReason::NotNumericString("intent.amountIn")
        );
    }

    #[test]
    fn pending_rejects_hex_gas_price() {
        let mut raw = pending_json();
        raw["intent"]["gasPrice"] = json!("0x77359400");
        assert!(validate_pending(&raw).is_err());
    }

    #[test]
    fn pending_rejects_short_path() {
        let mut raw = pending_json();
        raw["intent"]["path"] = json!(["WETH"]);
        assert_eq!(
            validate_pending(&raw).unwrap_err(),
            RejectReason::PathTooShort(1)
        );
    }

    #[test]
    fn pending_rejects_excess_slippage() {
        let mut raw = pending_json();
        raw["intent"]["slippageTolerance"] = json!(0.6);
        assert!(validate_pending(&raw).is_err());
    }

    #[test]
    fn numeric_string_check() {
        assert!(is_numeric_string("0"));
        assert!(is_numeric_string("123456789012345678901234567890"));
        assert!(!is_numeric_string(""));
        assert!(!is_numeric_string("1.5"));
        assert!(!is_numeric_string("1e9"));
    }
}
