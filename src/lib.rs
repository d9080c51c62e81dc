//! Custodial token ledger with signed checks.
//!
//! A depositor pre-funds balances for any number of holders. A holder can
//! take the funds out directly, or sign a check off-line that lets somebody
//! else (the recipient, or a relayer acting for the recipient) sweep the
//! whole balance to the recipient.
//!
//! * [`address`] — 20-byte identities.
//! * [`auth`] — check digest, signing conventions, and signer recovery over
//!   secp256k1.
//! * [`gateway`] — the fungible-asset surface the ledger pulls from and
//!   pushes to, with an in-memory implementation.
//! * [`ledger`] — balances and the deposit / withdraw / redeem / redeem-for
//!   transitions.
//! * [`config`] — TOML deployment settings.

pub mod address;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod ledger;

pub use address::Address;
pub use auth::{CheckSigner, MessageConvention, RecoverableSignature};
pub use config::LedgerConfig;
pub use gateway::{Amount, AssetGateway, Token, TokenRegistry};
pub use ledger::{Ledger, LedgerError, LedgerEvent, LedgerSnapshot, Redemption};
