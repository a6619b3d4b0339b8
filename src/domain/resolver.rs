//! Token-balance resolution.
//!
//! Reduces a provider payment to the single settlement-token balance an
//! order can be reconciled against.

use super::payment::{BalanceKey, Payment, Token, TokenBalance};
use rust_decimal::Decimal;

/// A balance lifted out of a payment for one synchronization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBalance {
    pub key: BalanceKey,
    pub balance: Decimal,
    pub decimals: u32,
    pub block_number: Option<String>,
    pub raw_balance: Option<String>,
}

impl NormalizedBalance {
    fn from_entry(key: &BalanceKey, entry: &TokenBalance) -> Self {
        Self {
            key: key.clone(),
            balance: entry.balance,
            decimals: entry.token_decimals,
            block_number: entry.block_number.clone(),
            raw_balance: entry.raw_token_balance.clone(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.key.chain
    }

    pub fn token(&self) -> &str {
        &self.key.address
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Single(NormalizedBalance),
    /// Funds arrived in more than one token; needs manual resolution.
    MultiToken(Vec<NormalizedBalance>),
    NotFound,
}

/// Resolves `payment` against the tokens configured for `currency`.
pub fn resolve(payment: &Payment, tokens: &[Token], currency: &str) -> Resolution {
    // Any second positive balance is ambiguous, configured or not.
    let funded = funded_balances(payment);
    if funded.len() > 1 {
        return Resolution::MultiToken(funded);
    }

    let candidates = suppress_algo(
        tokens
            .iter()
            .filter(|token| token.currency == currency)
            .filter_map(|token| {
                let key = token.key();
                payment
                    .balances
                    .get(&key)
                    .filter(|entry| entry.balance > Decimal::ZERO)
                    .map(|entry| NormalizedBalance::from_entry(&key, entry))
            })
            .collect(),
    );

    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (None, _) => Resolution::NotFound,
        (Some(single), None) => Resolution::Single(single),
        (Some(first), Some(second)) => {
            let mut all = vec![first, second];
            all.extend(candidates);
            Resolution::MultiToken(all)
        }
    }
}

/// Every positive balance in `payment`, after ALGO suppression.
pub fn funded_balances(payment: &Payment) -> Vec<NormalizedBalance> {
    suppress_algo(
        payment
            .balances
            .iter()
            .filter(|(_, entry)| entry.balance > Decimal::ZERO)
            .map(|(key, entry)| NormalizedBalance::from_entry(key, entry))
            .collect(),
    )
}

/// Drops the native ALGO entry when an Algorand asset was also paid.
fn suppress_algo(balances: Vec<NormalizedBalance>) -> Vec<NormalizedBalance> {
    let asa_paid = balances
        .iter()
        .any(|b| b.key.is_algorand() && !b.key.is_algo() && b.balance > Decimal::ZERO);
    if !asa_paid {
        return balances;
    }
    balances.into_iter().filter(|b| !b.key.is_algo()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn token(network: &str, chain: &str, addr: &str, currency: &str) -> Token {
        Token {
            network: network.into(),
            chain: chain.into(),
            addr: addr.into(),
            currency: currency.into(),
        }
    }

    fn payment(entries: &[(&str, &str, &str, Decimal)]) -> Payment {
        entries
            .iter()
            .fold(Payment::new("1", 0), |p, (network, chain, addr, amount)| {
                p.with_balance(
                    BalanceKey::new(*network, *chain, *addr),
                    TokenBalance::new(*amount, 6),
                )
            })
    }

    fn algo_tokens() -> Vec<Token> {
        vec![
            token("algorand", "alg_testnet", "ALGO", "USD"),
            token("algorand", "alg_testnet", "ASA1", "USD"),
        ]
    }

    #[test]
    fn test_algo_suppressed_when_asset_paid() {
        let payment = payment(&[
            ("algorand", "alg_testnet", "ALGO", dec!(5)),
            ("algorand", "alg_testnet", "ASA1", dec!(3)),
        ]);

        match resolve(&payment, &algo_tokens(), "USD") {
            Resolution::Single(balance) => {
                assert_eq!(balance.token(), "ASA1");
                assert_eq!(balance.balance, dec!(3));
            }
            other => panic!("expected single balance, got {:?}", other),
        }
    }

    #[test]
    fn test_algo_alone_resolves_to_algo() {
        let payment = payment(&[("algorand", "alg_testnet", "ALGO", dec!(5))]);

        match resolve(&payment, &algo_tokens(), "USD") {
            Resolution::Single(balance) => assert_eq!(balance.token(), "ALGO"),
            other => panic!("expected single balance, got {:?}", other),
        }
    }

    #[test]
    fn test_two_funded_tokens_are_ambiguous() {
        let payment = payment(&[
            ("ethereum", "goerli", "0xusdc", dec!(50)),
            ("ethereum", "goerli", "0xdai", dec!(50)),
        ]);
        let tokens = vec![token("ethereum", "goerli", "0xusdc", "USD")];

        match resolve(&payment, &tokens, "USD") {
            Resolution::MultiToken(balances) => assert_eq!(balances.len(), 2),
            other => panic!("expected multi token, got {:?}", other),
        }
    }

    #[test]
    fn test_unconfigured_or_zero_balance_is_not_found() {
        let payment = payment(&[
            ("ethereum", "goerli", "0xusdc", dec!(0)),
            ("ethereum", "goerli", "0xeur", dec!(10)),
        ]);
        let tokens = vec![
            token("ethereum", "goerli", "0xusdc", "USD"),
            token("ethereum", "goerli", "0xeur", "EUR"),
        ];

        assert_eq!(resolve(&payment, &tokens, "USD"), Resolution::NotFound);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let payment = payment(&[
            ("algorand", "alg_testnet", "ALGO", dec!(5)),
            ("algorand", "alg_testnet", "ASA1", dec!(3)),
        ]);
        let first = resolve(&payment, &algo_tokens(), "USD");
        for _ in 0..10 {
            assert_eq!(resolve(&payment, &algo_tokens(), "USD"), first);
        }
    }
}
