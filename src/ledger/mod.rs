use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::auth::{self, AuthError, MessageConvention, RecoverableSignature};
use crate::config::LedgerConfig;
use crate::gateway::{Amount, AssetGateway, GatewayError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("deposit of {asset} from {depositor} could not be pulled: {source}")]
    InsufficientFunds {
        asset: Address,
        depositor: Address,
        source: GatewayError,
    },
    #[error("invalid authorization: {0}")]
    InvalidAuthorization(#[from] AuthorizationFailure),
    #[error("transfer of {amount} {asset} to {to} failed: {source}")]
    TransferFailure {
        asset: Address,
        to: Address,
        amount: Amount,
        source: GatewayError,
    },
    #[error("deposit needs at least one holder and a positive amount")]
    EmptyDeposit,
    #[error("ledger {0} cannot deposit from its own custody")]
    SelfDeposit(Address),
    #[error("amount overflow in {asset}")]
    AmountOverflow { asset: Address },
    #[error("{asset}: {outstanding} owed to holders but only {custody} in custody")]
    CustodyShortfall {
        asset: Address,
        outstanding: Amount,
        custody: Amount,
    },
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("snapshot root does not match its balance entries")]
    SnapshotMismatch,
}

/// Why a check was refused.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthorizationFailure {
    #[error(transparent)]
    Signature(#[from] AuthError),
    #[error("signer {signer} holds no balance of {asset}")]
    UnfundedSigner { signer: Address, asset: Address },
}

impl LedgerError {
    /// Short machine-friendly label of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::InvalidAuthorization(_) => "invalid_authorization",
            LedgerError::TransferFailure { .. } => "transfer_failure",
            LedgerError::EmptyDeposit => "empty_deposit",
            LedgerError::SelfDeposit(_) => "self_deposit",
            LedgerError::AmountOverflow { .. } => "amount_overflow",
            LedgerError::CustodyShortfall { .. } => "custody_shortfall",
            LedgerError::Gateway(_) => "gateway",
            LedgerError::SnapshotMismatch => "snapshot_mismatch",
        }
    }
}

/// Amounts inside events are written as decimal strings. The `type` tag
/// makes serde buffer the fields, and that buffer has no 128-bit integers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposited {
        asset: Address,
        depositor: Address,
        holders: Vec<Address>,
        #[serde(with = "decimal_amount")]
        amount_per_holder: Amount,
        #[serde(with = "decimal_amount")]
        total: Amount,
    },
    Withdrawn {
        asset: Address,
        holder: Address,
        #[serde(with = "decimal_amount")]
        amount: Amount,
    },
    Redeemed {
        asset: Address,
        signer: Address,
        recipient: Address,
        submitter: Address,
        #[serde(with = "decimal_amount")]
        amount: Amount,
    },
}

/// Outcome of a successful `redeem` / `redeem_for`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Redemption {
    pub signer: Address,
    pub recipient: Address,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntry {
    pub asset: Address,
    pub holder: Address,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub identity: Address,
    pub convention: MessageConvention,
    pub entries: Vec<BalanceEntry>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub merkle_root: [u8; 32],
}

/// Custodial balances of many assets, redeemable by signed checks.
///
/// Every mutating call takes `&mut self` and writes balances only after the
/// gateway call it depends on has succeeded, so a failed call leaves the
/// ledger untouched.
pub struct Ledger<G> {
    identity: Address,
    convention: MessageConvention,
    balances: BTreeMap<(Address, Address), Amount>,
    events: Vec<LedgerEvent>,
    gateway: G,
}

impl<G: AssetGateway> Ledger<G> {
    pub fn new(identity: Address, convention: MessageConvention, gateway: G) -> Self {
        Self {
            identity,
            convention,
            balances: BTreeMap::new(),
            events: Vec::new(),
            gateway,
        }
    }

    pub fn from_config(config: &LedgerConfig, gateway: G) -> Self {
        Self::new(config.identity, config.convention, gateway)
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn convention(&self) -> MessageConvention {
        self.convention
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn into_gateway(self) -> G {
        self.gateway
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn balance_of(&self, asset: &Address, holder: &Address) -> Amount {
        self.balances.get(&(*asset, *holder)).copied().unwrap_or(0)
    }

    /// Sum of all entries held for `asset`.
    pub fn outstanding(&self, asset: &Address) -> Amount {
        self.balances
            .range((*asset, Address::ZERO)..=(*asset, Address([0xff; 20])))
            .fold(0, |acc: Amount, (_, amount)| acc.saturating_add(*amount))
    }

    /// Units of `asset` the gateway reports as held by this ledger.
    pub fn custody(&self, asset: &Address) -> Result<Amount, LedgerError> {
        Ok(self.gateway.balance_of(asset, &self.identity)?)
    }

    /// Fails if holders are owed more of `asset` than the ledger holds.
    pub fn audit(&self, asset: &Address) -> Result<(), LedgerError> {
        let outstanding = self.outstanding(asset);
        let custody = self.custody(asset)?;
        if outstanding > custody {
            return Err(LedgerError::CustodyShortfall {
                asset: *asset,
                outstanding,
                custody,
            });
        }
        Ok(())
    }

    /// Pull `amount_per_holder × holders.len()` from `caller` and credit each
    /// listed holder. Duplicate holders accumulate. Returns the total pulled.
    pub fn deposit(
        &mut self,
        caller: &Address,
        asset: &Address,
        holders: &[Address],
        amount_per_holder: Amount,
    ) -> Result<Amount, LedgerError> {
        if holders.is_empty() || amount_per_holder == 0 {
            return Err(LedgerError::EmptyDeposit);
        }
        // a pull from our own wallet moves nothing
        if *caller == self.identity {
            warn!(%asset, "deposit from the ledger identity refused");
            return Err(LedgerError::SelfDeposit(self.identity));
        }
        let overflow = || LedgerError::AmountOverflow { asset: *asset };
        let total = amount_per_holder
            .checked_mul(holders.len() as Amount)
            .ok_or_else(overflow)?;

        let mut credited: BTreeMap<Address, Amount> = BTreeMap::new();
        for holder in holders {
            let entry = credited
                .entry(*holder)
                .or_insert_with(|| self.balance_of(asset, holder));
            *entry = entry.checked_add(amount_per_holder).ok_or_else(overflow)?;
        }

        self.gateway
            .transfer_from(asset, &self.identity, caller, &self.identity, total)
            .map_err(|source| {
                warn!(%asset, depositor = %caller, total, error = %source, "deposit pull failed");
                LedgerError::InsufficientFunds {
                    asset: *asset,
                    depositor: *caller,
                    source,
                }
            })?;

        for (holder, amount) in credited {
            self.balances.insert((*asset, holder), amount);
        }
        self.events.push(LedgerEvent::Deposited {
            asset: *asset,
            depositor: *caller,
            holders: holders.to_vec(),
            amount_per_holder,
            total,
        });
        info!(%asset, depositor = %caller, holders = holders.len(), total, "deposit credited");
        Ok(total)
    }

    /// Push the caller's whole balance of `asset` back to the caller. An
    /// empty balance is a successful no-op.
    pub fn withdraw(&mut self, caller: &Address, asset: &Address) -> Result<Amount, LedgerError> {
        let amount = self.balance_of(asset, caller);
        self.push(asset, caller, amount)?;
        self.balances.remove(&(*asset, *caller));
        if amount > 0 {
            self.events.push(LedgerEvent::Withdrawn {
                asset: *asset,
                holder: *caller,
                amount,
            });
            info!(%asset, holder = %caller, amount, "withdrawn");
        }
        Ok(amount)
    }

    /// Redeem a check written out to the caller.
    pub fn redeem(
        &mut self,
        caller: &Address,
        asset: &Address,
        signature: &RecoverableSignature,
    ) -> Result<Redemption, LedgerError> {
        self.settle(caller, asset, caller, signature)
    }

    /// Redeem a check on behalf of `recipient`. The caller only submits; the
    /// payout goes to `recipient`.
    pub fn redeem_for(
        &mut self,
        caller: &Address,
        asset: &Address,
        recipient: &Address,
        signature: &RecoverableSignature,
    ) -> Result<Redemption, LedgerError> {
        self.settle(caller, asset, recipient, signature)
    }

    fn settle(
        &mut self,
        submitter: &Address,
        asset: &Address,
        recipient: &Address,
        signature: &RecoverableSignature,
    ) -> Result<Redemption, LedgerError> {
        let digest = auth::build_digest(&self.identity, asset, recipient);
        debug!(%asset, %recipient, digest = %hex::encode(digest), "check digest");
        let hash = auth::signing_hash(&digest, self.convention);

        let signer = auth::recover_signer(&hash, signature).map_err(|err| {
            warn!(%asset, %recipient, error = %err, "check signature rejected");
            AuthorizationFailure::Signature(err)
        })?;
        let amount = self.balance_of(asset, &signer);
        if amount == 0 {
            warn!(%asset, %recipient, %signer, "check signer has no balance");
            return Err(AuthorizationFailure::UnfundedSigner {
                signer,
                asset: *asset,
            }
            .into());
        }

        self.push(asset, recipient, amount)?;
        self.balances.remove(&(*asset, signer));
        self.events.push(LedgerEvent::Redeemed {
            asset: *asset,
            signer,
            recipient: *recipient,
            submitter: *submitter,
            amount,
        });
        info!(%asset, %signer, %recipient, %submitter, amount, "check redeemed");
        Ok(Redemption {
            signer,
            recipient: *recipient,
            amount,
        })
    }

    fn push(&mut self, asset: &Address, to: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.gateway
            .transfer(asset, &self.identity, to, amount)
            .map_err(|source| {
                warn!(%asset, %to, amount, error = %source, "push transfer failed");
                LedgerError::TransferFailure {
                    asset: *asset,
                    to: *to,
                    amount,
                    source,
                }
            })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let entries: Vec<BalanceEntry> = self
            .balances
            .iter()
            .map(|((asset, holder), amount)| BalanceEntry {
                asset: *asset,
                holder: *holder,
                amount: *amount,
            })
            .collect();
        LedgerSnapshot {
            identity: self.identity,
            convention: self.convention,
            merkle_root: compute_merkle_root(&entries),
            entries,
            events: self.events.clone(),
        }
    }

    /// Rebuild a ledger from a snapshot, checking its root first.
    pub fn restore(snapshot: LedgerSnapshot, gateway: G) -> Result<Self, LedgerError> {
        if compute_merkle_root(&snapshot.entries) != snapshot.merkle_root {
            return Err(LedgerError::SnapshotMismatch);
        }
        let balances = snapshot
            .entries
            .into_iter()
            .filter(|e| e.amount > 0)
            .map(|e| ((e.asset, e.holder), e.amount))
            .collect();
        Ok(Self {
            identity: snapshot.identity,
            convention: snapshot.convention,
            balances,
            events: snapshot.events,
            gateway,
        })
    }
}

fn compute_merkle_root(entries: &[BalanceEntry]) -> [u8; 32] {
    let leaves = entries
        .iter()
        .map(|entry| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(b"entry");
            hasher.update(entry.asset.as_bytes());
            hasher.update(entry.holder.as_bytes());
            hasher.update(entry.amount.to_be_bytes());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"tokencheck-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("merkle root must be 32 bytes"))
    }
}

mod decimal_amount {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::gateway::Amount;

    pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CheckSigner;
    use crate::gateway::{Token, TokenRegistry};

    const UNIT: Amount = 10_000_000_000_000_000;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    struct Fixture {
        ledger: Ledger<TokenRegistry>,
        asset: Address,
        depositor: Address,
    }

    fn fixture() -> Fixture {
        let asset = addr(0xaa);
        let depositor = addr(0xd0);
        let identity = addr(0x1e);
        let mut registry = TokenRegistry::new();
        registry.register(asset, Token::new("TST"));
        registry.issue(&asset, &depositor, 100 * UNIT).unwrap();
        registry
            .approve(&asset, &depositor, &identity, 100 * UNIT)
            .unwrap();
        Fixture {
            ledger: Ledger::new(identity, MessageConvention::Eip191, registry),
            asset,
            depositor,
        }
    }

    fn wallet(f: &Fixture, who: &Address) -> Amount {
        f.ledger.gateway().balance_of(&f.asset, who).unwrap()
    }

    #[test]
    fn deposit_credits_each_holder() {
        let mut f = fixture();
        let holders = [addr(1), addr(2), addr(3)];
        let total = f
            .ledger
            .deposit(&f.depositor, &f.asset, &holders, UNIT)
            .unwrap();
        assert_eq!(total, 3 * UNIT);
        for holder in &holders {
            assert_eq!(f.ledger.balance_of(&f.asset, holder), UNIT);
        }
        assert_eq!(f.ledger.custody(&f.asset).unwrap(), 3 * UNIT);
        assert_eq!(wallet(&f, &f.depositor), 97 * UNIT);
        assert_eq!(f.ledger.events().len(), 1);
    }

    #[test]
    fn duplicate_holders_accumulate() {
        let mut f = fixture();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1), addr(1), addr(2)], 5)
            .unwrap();
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(1)), 10);
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(2)), 5);
        assert_eq!(f.ledger.outstanding(&f.asset), 15);
    }

    #[test]
    fn empty_deposit_is_rejected() {
        let mut f = fixture();
        assert!(matches!(
            f.ledger.deposit(&f.depositor, &f.asset, &[], UNIT),
            Err(LedgerError::EmptyDeposit)
        ));
        assert!(matches!(
            f.ledger.deposit(&f.depositor, &f.asset, &[addr(1)], 0),
            Err(LedgerError::EmptyDeposit)
        ));
    }

    #[test]
    fn deposit_over_allowance_credits_nothing() {
        let mut f = fixture();
        let holders = vec![addr(1); 101];
        let err = f
            .ledger
            .deposit(&f.depositor, &f.asset, &holders, UNIT)
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(1)), 0);
        assert_eq!(f.ledger.custody(&f.asset).unwrap(), 0);
        assert!(f.ledger.events().is_empty());
    }

    #[test]
    fn deposit_without_approval_fails() {
        let mut f = fixture();
        let stranger = addr(0x55);
        f.ledger
            .gateway_mut()
            .issue(&f.asset, &stranger, UNIT)
            .unwrap();
        let err = f
            .ledger
            .deposit(&stranger, &f.asset, &[addr(1)], UNIT)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                source: GatewayError::InsufficientAllowance { .. },
                ..
            }
        ));
    }

    #[test]
    fn ledger_cannot_deposit_from_itself() {
        let mut f = fixture();
        let identity = f.ledger.identity();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1)], UNIT)
            .unwrap();
        f.ledger
            .gateway_mut()
            .approve(&f.asset, &identity, &identity, 10 * UNIT)
            .unwrap();
        let before = f.ledger.snapshot();

        let err = f
            .ledger
            .deposit(&identity, &f.asset, &[addr(2)], UNIT)
            .unwrap_err();
        assert!(matches!(err, LedgerError::SelfDeposit(id) if id == identity));
        assert_eq!(err.kind(), "self_deposit");
        assert_eq!(f.ledger.snapshot(), before);
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(2)), 0);
        assert_eq!(f.ledger.custody(&f.asset).unwrap(), UNIT);
        f.ledger.audit(&f.asset).unwrap();
    }

    #[test]
    fn multiplication_overflow_is_caught() {
        let mut f = fixture();
        let err = f
            .ledger
            .deposit(&f.depositor, &f.asset, &[addr(1), addr(2)], Amount::MAX)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmountOverflow { .. }));
    }

    #[test]
    fn withdraw_pays_out_and_is_idempotent() {
        let mut f = fixture();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(3)], UNIT)
            .unwrap();
        assert_eq!(f.ledger.withdraw(&addr(3), &f.asset).unwrap(), UNIT);
        assert_eq!(wallet(&f, &addr(3)), UNIT);
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(3)), 0);

        assert_eq!(f.ledger.withdraw(&addr(3), &f.asset).unwrap(), 0);
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(3)), 0);
        assert_eq!(wallet(&f, &addr(3)), UNIT);
    }

    #[test]
    fn failed_withdraw_keeps_balance() {
        let mut f = fixture();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(3)], UNIT)
            .unwrap();
        let asset = f.asset;
        f.ledger
            .gateway_mut()
            .token_mut(&asset)
            .unwrap()
            .freeze(addr(3));
        let err = f.ledger.withdraw(&addr(3), &f.asset).unwrap_err();
        assert_eq!(err.kind(), "transfer_failure");
        assert_eq!(f.ledger.balance_of(&f.asset, &addr(3)), UNIT);
        assert_eq!(f.ledger.custody(&f.asset).unwrap(), UNIT);
    }

    #[test]
    fn redeem_sweeps_signer_balance_to_caller() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        let recipient = addr(4);
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &recipient,
                MessageConvention::Eip191,
            )
            .unwrap();
        let redemption = f.ledger.redeem(&recipient, &f.asset, &sig).unwrap();
        assert_eq!(
            redemption,
            Redemption {
                signer: holder.address(),
                recipient,
                amount: UNIT
            }
        );
        assert_eq!(wallet(&f, &recipient), UNIT);
        assert_eq!(f.ledger.balance_of(&f.asset, &holder.address()), 0);
        assert_eq!(f.ledger.custody(&f.asset).unwrap(), 0);
    }

    #[test]
    fn redeem_by_other_caller_recovers_unfunded_identity() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &addr(4),
                MessageConvention::Eip191,
            )
            .unwrap();
        let err = f.ledger.redeem(&addr(5), &f.asset, &sig).unwrap_err();
        assert_eq!(err.kind(), "invalid_authorization");
        assert_eq!(f.ledger.balance_of(&f.asset, &holder.address()), UNIT);
        assert_eq!(wallet(&f, &addr(5)), 0);
    }

    #[test]
    fn redeem_for_pays_named_recipient_not_relayer() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        let relayer = addr(0x77);
        let recipient = addr(4);
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &recipient,
                MessageConvention::Eip191,
            )
            .unwrap();
        f.ledger
            .redeem_for(&relayer, &f.asset, &recipient, &sig)
            .unwrap();
        assert_eq!(wallet(&f, &recipient), UNIT);
        assert_eq!(wallet(&f, &relayer), 0);
        match f.ledger.events().last() {
            Some(LedgerEvent::Redeemed { submitter, .. }) => assert_eq!(*submitter, relayer),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn spent_check_is_rejected_until_refunded() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        let recipient = addr(4);
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &recipient,
                MessageConvention::Eip191,
            )
            .unwrap();
        f.ledger.redeem(&recipient, &f.asset, &sig).unwrap();
        let err = f.ledger.redeem(&recipient, &f.asset, &sig).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidAuthorization(AuthorizationFailure::UnfundedSigner { .. })
        ));

        // no nonce: a fresh deposit revives the old check
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], 2 * UNIT)
            .unwrap();
        let again = f.ledger.redeem(&recipient, &f.asset, &sig).unwrap();
        assert_eq!(again.amount, 2 * UNIT);
    }

    #[test]
    fn malformed_signature_is_invalid_authorization() {
        let mut f = fixture();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1)], UNIT)
            .unwrap();
        let sig = RecoverableSignature {
            r: [0u8; 32],
            s: [1u8; 32],
            v: 27,
        };
        let err = f.ledger.redeem(&addr(4), &f.asset, &sig).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidAuthorization(AuthorizationFailure::Signature(
                AuthError::ScalarOutOfRange("r")
            ))
        ));
    }

    #[test]
    fn check_for_other_ledger_is_rejected() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(&addr(0x99), &f.asset, &addr(4), MessageConvention::Eip191)
            .unwrap();
        assert!(f.ledger.redeem(&addr(4), &f.asset, &sig).is_err());
        assert_eq!(f.ledger.balance_of(&f.asset, &holder.address()), UNIT);
    }

    #[test]
    fn raw_convention_ledger_rejects_eip191_checks() {
        let asset = addr(0xaa);
        let identity = addr(0x1e);
        let holder = CheckSigner::random();
        let mut registry = TokenRegistry::new();
        registry.register(asset, Token::new("TST"));
        registry.issue(&asset, &addr(0xd0), UNIT).unwrap();
        registry.approve(&asset, &addr(0xd0), &identity, UNIT).unwrap();
        let mut ledger = Ledger::new(identity, MessageConvention::Raw, registry);
        ledger
            .deposit(&addr(0xd0), &asset, &[holder.address()], UNIT)
            .unwrap();

        let personal = holder
            .sign_authorization(&identity, &asset, &addr(4), MessageConvention::Eip191)
            .unwrap();
        assert!(ledger.redeem(&addr(4), &asset, &personal).is_err());

        let raw = holder
            .sign_authorization(&identity, &asset, &addr(4), MessageConvention::Raw)
            .unwrap();
        assert_eq!(ledger.redeem(&addr(4), &asset, &raw).unwrap().amount, UNIT);
    }

    #[test]
    fn failed_redeem_push_keeps_signer_balance() {
        let mut f = fixture();
        let holder = CheckSigner::random();
        let recipient = addr(4);
        f.ledger
            .deposit(&f.depositor, &f.asset, &[holder.address()], UNIT)
            .unwrap();
        let sig = holder
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &recipient,
                MessageConvention::Eip191,
            )
            .unwrap();
        let asset = f.asset;
        f.ledger
            .gateway_mut()
            .token_mut(&asset)
            .unwrap()
            .freeze(recipient);
        let err = f.ledger.redeem(&recipient, &f.asset, &sig).unwrap_err();
        assert_eq!(err.kind(), "transfer_failure");
        assert_eq!(f.ledger.balance_of(&f.asset, &holder.address()), UNIT);
        f.ledger.audit(&f.asset).unwrap();
    }

    #[test]
    fn snapshot_restores_and_detects_tampering() {
        let mut f = fixture();
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1), addr(2)], UNIT)
            .unwrap();
        let snapshot = f.ledger.snapshot();
        assert_eq!(snapshot.entries.len(), 2);

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        let gateway = f.ledger.into_gateway();
        let restored = Ledger::restore(decoded.clone(), gateway.clone()).unwrap();
        assert_eq!(restored.balance_of(&f.asset, &addr(2)), UNIT);
        assert_eq!(restored.snapshot().merkle_root, snapshot.merkle_root);

        let mut tampered = decoded;
        tampered.entries[0].amount += 1;
        assert!(matches!(
            Ledger::restore(tampered, gateway),
            Err(LedgerError::SnapshotMismatch)
        ));
    }

    #[test]
    fn snapshot_with_every_event_kind_survives_json() {
        let mut f = fixture();
        let signer = CheckSigner::random();
        let recipient = addr(0x77);
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1), signer.address()], UNIT)
            .unwrap();
        f.ledger.withdraw(&addr(1), &f.asset).unwrap();
        let sig = signer
            .sign_authorization(
                &f.ledger.identity(),
                &f.asset,
                &recipient,
                f.ledger.convention(),
            )
            .unwrap();
        f.ledger.redeem(&recipient, &f.asset, &sig).unwrap();

        let snapshot = f.ledger.snapshot();
        assert_eq!(snapshot.events.len(), 3);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(&format!("\"total\":\"{}\"", 2 * UNIT)));
        let decoded: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn event_amounts_above_u64_are_kept() {
        let event = LedgerEvent::Withdrawn {
            asset: addr(0xaa),
            holder: addr(1),
            amount: Amount::MAX,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"withdrawn\""));
        let back: LedgerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn merkle_root_is_deterministic() {
        let mut f = fixture();
        let empty = f.ledger.snapshot().merkle_root;
        f.ledger
            .deposit(&f.depositor, &f.asset, &[addr(1)], UNIT)
            .unwrap();
        let root1 = f.ledger.snapshot().merkle_root;
        let root2 = f.ledger.snapshot().merkle_root;
        assert_eq!(root1, root2);
        assert_ne!(root1, empty);
    }
}
