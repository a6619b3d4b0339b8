//! Provider-side payment model.
//!
//! These types mirror what the hosted-payment provider returns. They are
//! read-only to the reconciliation engine.

use super::order::OrderId;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const ALGORAND_NETWORK: &str = "algorand";
pub const ALGO_ADDRESS: &str = "ALGO";

/// Provider functions that move funds back to the payer.
pub const REFUND_FUNCTIONS: [&str; 2] = ["createAndRefundWallet", "refundWallet"];

/// Location of a token balance inside a payment: network, chain and token address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub network: String,
    pub chain: String,
    pub address: String,
}

impl BalanceKey {
    pub fn new(
        network: impl Into<String>,
        chain: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            chain: chain.into(),
            address: address.into(),
        }
    }

    pub fn is_algorand(&self) -> bool {
        self.network == ALGORAND_NETWORK
    }

    /// The native Algorand gas token.
    pub fn is_algo(&self) -> bool {
        self.is_algorand() && self.address == ALGO_ADDRESS
    }
}

/// A single token balance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub balance: Decimal,
    #[serde(default)]
    pub token_decimals: u32,
    #[serde(
        default,
        rename = "blockNum",
        alias = "block_number",
        deserialize_with = "string_or_number"
    )]
    pub block_number: Option<String>,
    #[serde(
        default,
        rename = "token_balance",
        alias = "raw_token_balance",
        deserialize_with = "string_or_number"
    )]
    pub raw_token_balance: Option<String>,
    #[serde(default, rename = "updatedAt", alias = "updated_at")]
    pub updated_at: Option<i64>,
}

impl TokenBalance {
    pub fn new(balance: Decimal, token_decimals: u32) -> Self {
        Self {
            balance,
            token_decimals,
            block_number: None,
            raw_token_balance: None,
            updated_at: None,
        }
    }
}

type NestedBalances = BTreeMap<String, BTreeMap<String, BTreeMap<String, TokenBalance>>>;

/// Flat `(network, chain, address) -> balance` view of a payment's balances.
///
/// The provider nests balances as network → chain → token address; this
/// map flattens them on deserialization so lookups are a single typed key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "NestedBalances", into = "NestedBalances")]
pub struct BalanceMap(BTreeMap<BalanceKey, TokenBalance>);

impl BalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: BalanceKey, balance: TokenBalance) {
        self.0.insert(key, balance);
    }

    pub fn get(&self, key: &BalanceKey) -> Option<&TokenBalance> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BalanceKey, &TokenBalance)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<NestedBalances> for BalanceMap {
    fn from(nested: NestedBalances) -> Self {
        let mut flat = BTreeMap::new();
        for (network, chains) in nested {
            for (chain, tokens) in chains {
                for (address, balance) in tokens {
                    flat.insert(BalanceKey::new(network.clone(), chain.clone(), address), balance);
                }
            }
        }
        Self(flat)
    }
}

impl From<BalanceMap> for NestedBalances {
    fn from(map: BalanceMap) -> Self {
        let mut nested = NestedBalances::new();
        for (key, balance) in map.0 {
            nested
                .entry(key.network)
                .or_default()
                .entry(key.chain)
                .or_default()
                .insert(key.address, balance);
        }
        nested
    }
}

/// A provider payment. Its id is the id of the order it pays for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: OrderId,
    #[serde(default)]
    pub addresses: serde_json::Value,
    #[serde(default)]
    pub balances: BalanceMap,
    #[serde(default, rename = "createdAt", alias = "created_at")]
    pub created_at: i64,
    #[serde(default, rename = "updatedAt", alias = "updated_at")]
    pub updated_at: i64,
}

impl Payment {
    pub fn new(id: impl Into<OrderId>, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            addresses: serde_json::Value::Null,
            balances: BalanceMap::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    pub fn with_balance(mut self, key: BalanceKey, balance: TokenBalance) -> Self {
        self.balances.insert(key, balance);
        self
    }
}

/// A settlement token the merchant accepts for a store currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub network: String,
    pub chain: String,
    pub addr: String,
    pub currency: String,
}

impl Token {
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.network.clone(), self.chain.clone(), self.addr.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInputs {
    #[serde(default)]
    pub token: Option<String>,
}

/// A settle/refund operation recorded by the provider for a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOperation {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub func_name: Option<String>,
    /// `None` while the operation is still pending on chain.
    #[serde(default, deserialize_with = "operation_status")]
    pub status: Option<bool>,
    #[serde(default)]
    pub inputs: OperationInputs,
}

impl PaymentOperation {
    /// True when this operation is a mined, successful refund of `key`'s token.
    pub fn refunded(&self, key: &BalanceKey) -> bool {
        self.hash.is_some()
            && self.status == Some(true)
            && self.chain.as_deref() == Some(key.chain.as_str())
            && self.inputs.token.as_deref() == Some(key.address.as_str())
            && self
                .func_name
                .as_deref()
                .is_some_and(|name| REFUND_FUNCTIONS.contains(&name))
    }
}

/// One page of a paginated provider listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// Continuation token, treating an empty string as the end.
    pub fn next(&self) -> Option<&str> {
        self.next_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    #[serde(default)]
    pub txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub id: OrderId,
    pub currency: String,
    pub amount: Decimal,
    pub success_url: String,
    pub cancel_url: String,
    pub base64_transform: bool,
}

/// HMAC parameters the hosted checkout appends to its success redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackValidation {
    pub hmac_alg: String,
    pub hmac_input: String,
    #[serde(rename = "hmac_keyId")]
    pub hmac_key_id: String,
    pub hmac_value: String,
}

/// Block-explorer link for a transaction hash on a provider chain.
pub fn explorer_link(hash: &str, chain: &str) -> Option<String> {
    let base = match chain {
        "alg_mainnet" => "https://algoexplorer.io/tx/",
        "alg_testnet" => "https://testnet.algoexplorer.io/tx/",
        "rsk" => "https://explorer.rsk.co/tx/",
        "rsk_testnet" => "https://explorer.testnet.rsk.co/tx/",
        "mainnet" | "xdai" => "https://etherscan.io/tx/",
        "goerli" | "xdai_testnet" => "https://goerli.etherscan.io/tx/",
        _ => return None,
    };
    Some(format!("{}{}", base, hash))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn operation_status<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::String(s)) => match s.as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const PAYMENT_JSON: &str = r#"{
        "id": "535",
        "addresses": {"ethereum": {"goerli": {"addr": "0xbead07d152c64159190842ec1d6144f1a4a6cae9"}}},
        "balances": {
            "ethereum": {
                "goerli": {
                    "0x115615dbd0f835344725146fa6343219315f15e5": {
                        "blockNum": "1871014",
                        "token_balance": "10000000",
                        "balance": "10",
                        "token_decimals": 6
                    }
                }
            }
        },
        "createdAt": 1577086517,
        "updatedAt": 1577086771
    }"#;

    #[test]
    fn test_payment_balances_flatten() {
        let payment: Payment = serde_json::from_str(PAYMENT_JSON).unwrap();
        assert_eq!(payment.id, OrderId::new("535"));
        assert_eq!(payment.balances.len(), 1);

        let key = BalanceKey::new(
            "ethereum",
            "goerli",
            "0x115615dbd0f835344725146fa6343219315f15e5",
        );
        let balance = payment.balances.get(&key).unwrap();
        assert_eq!(balance.balance, dec!(10));
        assert_eq!(balance.token_decimals, 6);
        assert_eq!(balance.block_number.as_deref(), Some("1871014"));
        assert_eq!(balance.raw_token_balance.as_deref(), Some("10000000"));

        let missing = BalanceKey::new("ethereum", "mainnet", "0x115615dbd0f835344725146fa6343219315f15e5");
        assert!(payment.balances.get(&missing).is_none());
    }

    #[test]
    fn test_balance_map_serializes_nested() {
        let payment: Payment = serde_json::from_str(PAYMENT_JSON).unwrap();
        let json = serde_json::to_value(&payment).unwrap();
        assert_eq!(
            json["balances"]["ethereum"]["goerli"]["0x115615dbd0f835344725146fa6343219315f15e5"]["balance"],
            "10"
        );
    }

    #[test]
    fn test_operation_status_accepts_yes_no_and_bool() {
        let op: PaymentOperation =
            serde_json::from_str(r#"{"txid": "t1", "status": "yes", "hash": "0xabc", "chain": "goerli"}"#)
                .unwrap();
        assert_eq!(op.status, Some(true));

        let op: PaymentOperation = serde_json::from_str(r#"{"status": false}"#).unwrap();
        assert_eq!(op.status, Some(false));

        let op: PaymentOperation = serde_json::from_str(r#"{"status": null}"#).unwrap();
        assert_eq!(op.status, None);
    }

    #[test]
    fn test_refunded_requires_matching_successful_refund() {
        let key = BalanceKey::new("ethereum", "goerli", "0xtoken");
        let mut op = PaymentOperation {
            txid: Some("t1".into()),
            hash: Some("0xhash".into()),
            chain: Some("goerli".into()),
            func_name: Some("refundWallet".into()),
            status: Some(true),
            inputs: OperationInputs {
                token: Some("0xtoken".into()),
            },
        };
        assert!(op.refunded(&key));

        op.func_name = Some("settle".into());
        assert!(!op.refunded(&key));

        op.func_name = Some("createAndRefundWallet".into());
        op.status = None;
        assert!(!op.refunded(&key));

        op.status = Some(true);
        op.hash = None;
        assert!(!op.refunded(&key));
    }

    #[test]
    fn test_explorer_links() {
        assert_eq!(
            explorer_link("0x1", "goerli").as_deref(),
            Some("https://goerli.etherscan.io/tx/0x1")
        );
        assert_eq!(
            explorer_link("ABC", "alg_mainnet").as_deref(),
            Some("https://algoexplorer.io/tx/ABC")
        );
        assert!(explorer_link("0x1", "unknown").is_none());
    }

    #[test]
    fn test_page_empty_next_token_is_end() {
        let page: Page<Payment> = serde_json::from_str(r#"{"results": [], "next_token": ""}"#).unwrap();
        assert!(page.next().is_none());
    }
}
