use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::address::Address;

pub type Amount = u128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unknown asset {asset}")]
    UnknownAsset { asset: Address },
    #[error("{owner} holds {available} of {asset}, needs {required}")]
    InsufficientBalance {
        asset: Address,
        owner: Address,
        available: Amount,
        required: Amount,
    },
    #[error("{spender} may move {available} of {asset} for {owner}, needs {required}")]
    InsufficientAllowance {
        asset: Address,
        owner: Address,
        spender: Address,
        available: Amount,
        required: Amount,
    },
    #[error("account {account} is frozen for {asset}")]
    Frozen { asset: Address, account: Address },
    #[error("balance overflow for {account} in {asset}")]
    Overflow { asset: Address, account: Address },
}

/// Minimal fungible-asset surface the ledger relies on.
///
/// `caller` is the identity performing the call, i.e. the message sender of
/// the asset contract.
pub trait AssetGateway {
    fn balance_of(&self, asset: &Address, owner: &Address) -> Result<Amount, GatewayError>;

    fn allowance(
        &self,
        asset: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, GatewayError>;

    /// Push `amount` from `caller` to `to`.
    fn transfer(
        &mut self,
        asset: &Address,
        caller: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError>;

    /// Pull `amount` from `from` to `to` against the allowance `from` granted
    /// to `caller`.
    fn transfer_from(
        &mut self,
        asset: &Address,
        caller: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError>;

    fn approve(
        &mut self,
        asset: &Address,
        caller: &Address,
        spender: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError>;
}

/// In-memory ERC-20 style token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Token {
    pub symbol: String,
    pub total_supply: Amount,
    balances: BTreeMap<Address, Amount>,
    allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
    #[serde(default)]
    frozen: BTreeSet<Address>,
}

impl Token {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    pub fn balance(&self, owner: &Address) -> Amount {
        self.balances.get(owner).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|m| m.get(spender))
            .copied()
            .unwrap_or(0)
    }

    /// Mint new units to `to`.
    pub fn issue(&mut self, asset: &Address, to: &Address, amount: Amount) -> Result<(), GatewayError> {
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(GatewayError::Overflow {
                asset: *asset,
                account: *to,
            })?;
        let balance = self
            .balance(to)
            .checked_add(amount)
            .ok_or(GatewayError::Overflow {
                asset: *asset,
                account: *to,
            })?;
        self.total_supply = supply;
        self.set_balance(to, balance);
        Ok(())
    }

    pub fn freeze(&mut self, account: Address) {
        self.frozen.insert(account);
    }

    pub fn unfreeze(&mut self, account: &Address) {
        self.frozen.remove(account);
    }

    fn set_balance(&mut self, owner: &Address, amount: Amount) {
        if amount == 0 {
            self.balances.remove(owner);
        } else {
            self.balances.insert(*owner, amount);
        }
    }

    fn ensure_unfrozen(&self, asset: &Address, account: &Address) -> Result<(), GatewayError> {
        if self.frozen.contains(account) {
            return Err(GatewayError::Frozen {
                asset: *asset,
                account: *account,
            });
        }
        Ok(())
    }

    fn move_units(
        &mut self,
        asset: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError> {
        self.ensure_unfrozen(asset, from)?;
        self.ensure_unfrozen(asset, to)?;
        let available = self.balance(from);
        if available < amount {
            return Err(GatewayError::InsufficientBalance {
                asset: *asset,
                owner: *from,
                available,
                required: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance(to)
            .checked_add(amount)
            .ok_or(GatewayError::Overflow {
                asset: *asset,
                account: *to,
            })?;
        self.set_balance(from, available - amount);
        self.set_balance(to, credited);
        Ok(())
    }
}

/// Registry of in-memory tokens keyed by asset address.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenRegistry {
    tokens: BTreeMap<Address, Token>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, asset: Address, token: Token) {
        self.tokens.insert(asset, token);
    }

    pub fn token(&self, asset: &Address) -> Result<&Token, GatewayError> {
        self.tokens
            .get(asset)
            .ok_or(GatewayError::UnknownAsset { asset: *asset })
    }

    pub fn token_mut(&mut self, asset: &Address) -> Result<&mut Token, GatewayError> {
        self.tokens
            .get_mut(asset)
            .ok_or(GatewayError::UnknownAsset { asset: *asset })
    }

    pub fn issue(&mut self, asset: &Address, to: &Address, amount: Amount) -> Result<(), GatewayError> {
        self.token_mut(asset)?.issue(asset, to, amount)
    }

    pub fn assets(&self) -> impl Iterator<Item = (&Address, &Token)> {
        self.tokens.iter()
    }
}

impl AssetGateway for TokenRegistry {
    fn balance_of(&self, asset: &Address, owner: &Address) -> Result<Amount, GatewayError> {
        Ok(self.token(asset)?.balance(owner))
    }

    fn allowance(
        &self,
        asset: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, GatewayError> {
        Ok(self.token(asset)?.allowance(owner, spender))
    }

    fn transfer(
        &mut self,
        asset: &Address,
        caller: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError> {
        self.token_mut(asset)?.move_units(asset, caller, to, amount)
    }

    fn transfer_from(
        &mut self,
        asset: &Address,
        caller: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError> {
        let token = self.token_mut(asset)?;
        let allowed = token.allowance(from, caller);
        if allowed < amount {
            return Err(GatewayError::InsufficientAllowance {
                asset: *asset,
                owner: *from,
                spender: *caller,
                available: allowed,
                required: amount,
            });
        }
        token.move_units(asset, from, to, amount)?;
        token
            .allowances
            .entry(*from)
            .or_default()
            .insert(*caller, allowed - amount);
        Ok(())
    }

    fn approve(
        &mut self,
        asset: &Address,
        caller: &Address,
        spender: &Address,
        amount: Amount,
    ) -> Result<(), GatewayError> {
        let token = self.token_mut(asset)?;
        token
            .allowances
            .entry(*caller)
            .or_default()
            .insert(*spender, amount);
        Ok(())
    }
}
