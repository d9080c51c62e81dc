//! Operator CLI for a tokencheck ledger.
//!
//! All state (ledger balances, events, and the in-memory token registry)
//! lives in one JSON file. Every mutating command loads it, runs exactly one
//! ledger operation, and writes it back only if the operation succeeded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tokencheck::{
    Address, Amount, AssetGateway, CheckSigner, Ledger, LedgerConfig, LedgerSnapshot,
    MessageConvention, RecoverableSignature, Token, TokenRegistry,
};

const STATE_VERSION: u8 = 1;

#[derive(Parser)]
#[command(name = "tokencheck")]
#[command(about = "Custodial token ledger with off-chain signed checks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = "tokencheck.toml")]
    config: PathBuf,

    /// State file path
    #[arg(short, long, global = true, default_value = "tokencheck.json")]
    state: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config with a fresh ledger identity and an empty state file
    Init {
        /// Deployment label
        #[arg(long, default_value = "tokencheck")]
        name: String,
        /// raw or eip191
        #[arg(long, default_value = "raw")]
        convention: MessageConvention,
        /// Use this identity instead of a random one
        #[arg(long)]
        identity: Option<Address>,
    },
    /// Generate a holder key
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Mint test units of an asset (registers the asset on first use)
    Issue {
        #[arg(long)]
        asset: Address,
        #[arg(long)]
        to: Address,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
        #[arg(long, default_value = "TST")]
        symbol: String,
    },
    /// Let the ledger pull up to `amount` from `from`
    Approve {
        #[arg(long)]
        from: Address,
        #[arg(long)]
        asset: Address,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
    /// Credit each holder with `amount` pulled from `from`
    Deposit {
        #[arg(long)]
        from: Address,
        #[arg(long)]
        asset: Address,
        #[arg(long, value_delimiter = ',', required = true)]
        holders: Vec<Address>,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
    /// Pay the caller's whole balance back to the caller
    Withdraw {
        #[arg(long)]
        from: Address,
        #[arg(long)]
        asset: Address,
    },
    /// Sign a check for `recipient` with a holder key
    Sign {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        asset: Address,
        #[arg(long)]
        recipient: Address,
    },
    /// Redeem a check made out to the caller
    Redeem {
        #[arg(long)]
        from: Address,
        #[arg(long)]
        asset: Address,
        #[arg(long)]
        sig: RecoverableSignature,
    },
    /// Submit a check on behalf of its recipient
    RedeemFor {
        #[arg(long)]
        from: Address,
        #[arg(long)]
        asset: Address,
        #[arg(long)]
        recipient: Address,
        #[arg(long)]
        sig: RecoverableSignature,
    },
    /// Show ledger and wallet balances of a holder
    Balance {
        #[arg(long)]
        asset: Address,
        #[arg(long)]
        holder: Address,
    },
    /// Print the ledger snapshot as JSON
    Snapshot {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u8,
    ledger: LedgerSnapshot,
    tokens: TokenRegistry,
}

/// Accepts plain integers and `<mantissa>e<exponent>` (e.g. `1e16`).
fn parse_amount(s: &str) -> Result<Amount, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => {
            let mantissa: Amount = mantissa.parse().map_err(|e| format!("{e}"))?;
            let exponent: u32 = exponent.parse().map_err(|e| format!("{e}"))?;
            (10 as Amount)
                .checked_pow(exponent)
                .and_then(|scale| mantissa.checked_mul(scale))
        }
        None => Some(s.parse::<Amount>().map_err(|e| format!("{e}"))?),
    };
    parsed.ok_or_else(|| format!("amount {s} overflows"))
}

fn load_ledger(state: &Path, config: &LedgerConfig) -> Result<Ledger<TokenRegistry>> {
    let bytes = fs::read(state).with_context(|| format!("read state {}", state.display()))?;
    let file: StateFile = serde_json::from_slice(&bytes).context("decode state")?;
    if file.version != STATE_VERSION {
        bail!("unsupported state version {}", file.version);
    }
    if file.ledger.identity != config.identity {
        bail!(
            "state belongs to ledger {}, config names {}",
            file.ledger.identity,
            config.identity
        );
    }
    let mut snapshot = file.ledger;
    snapshot.convention = config.convention;
    Ok(Ledger::restore(snapshot, file.tokens)?)
}

fn save_ledger(state: &Path, ledger: Ledger<TokenRegistry>) -> Result<()> {
    let file = StateFile {
        version: STATE_VERSION,
        ledger: ledger.snapshot(),
        tokens: ledger.into_gateway(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let tmp = state.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, state).with_context(|| format!("replace {}", state.display()))?;
    Ok(())
}

fn init_cmd(
    cli: &Cli,
    name: &str,
    convention: MessageConvention,
    identity: Option<Address>,
) -> Result<()> {
    let identity = identity.unwrap_or_else(|| CheckSigner::random().address());
    let config = LedgerConfig {
        name: name.to_string(),
        identity,
        convention,
    };
    fs::write(&cli.config, config.to_toml()?)
        .with_context(|| format!("write {}", cli.config.display()))?;
    save_ledger(
        &cli.state,
        Ledger::from_config(&config, TokenRegistry::new()),
    )?;
    println!("ledger {identity} initialised → {}", cli.state.display());
    Ok(())
}

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;
    let signer = CheckSigner::random();
    fs::write(out_dir.join("sk.hex"), signer.secret_hex())?;
    fs::write(out_dir.join("address.txt"), signer.address().to_hex())?;
    println!("{} → {}", signer.address(), out_dir.display());
    Ok(())
}

/// Load the ledger named by the config, run `op` inside its span, and write
/// the state back only when `persist` is set and `op` succeeded.
fn with_ledger<T>(
    cli: &Cli,
    persist: bool,
    op: impl FnOnce(&mut Ledger<TokenRegistry>) -> Result<T>,
) -> Result<T> {
    let config = LedgerConfig::load(&cli.config)?;
    let span = tracing::info_span!("ledger", name = %config.name, identity = %config.identity);
    let _guard = span.enter();
    let mut ledger = load_ledger(&cli.state, &config)?;
    let out = op(&mut ledger)?;
    if persist {
        save_ledger(&cli.state, ledger)?;
    }
    Ok(out)
}

fn issue_cmd(
    cli: &Cli,
    asset: &Address,
    to: &Address,
    amount: Amount,
    symbol: &str,
) -> Result<()> {
    with_ledger(cli, true, |ledger| {
        let gateway = ledger.gateway_mut();
        if gateway.token(asset).is_err() {
            gateway.register(*asset, Token::new(symbol));
            info!(%asset, %symbol, "asset registered");
        }
        gateway.issue(asset, to, amount)?;
        println!("issued {amount} of {asset} to {to}");
        Ok(())
    })
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Init {
            name,
            convention,
            identity,
        } => init_cmd(cli, name, *convention, *identity),
        Commands::Keygen { out_dir } => keygen_cmd(out_dir),
        Commands::Issue {
            asset,
            to,
            amount,
            symbol,
        } => issue_cmd(cli, asset, to, *amount, symbol),
        Commands::Approve {
            from,
            asset,
            amount,
        } => with_ledger(cli, true, |ledger| {
            let spender = ledger.identity();
            ledger
                .gateway_mut()
                .approve(asset, from, &spender, *amount)?;
            println!("{from} approved {amount} of {asset} for {spender}");
            Ok(())
        }),
        Commands::Deposit {
            from,
            asset,
            holders,
            amount,
        } => with_ledger(cli, true, |ledger| {
            let total = ledger.deposit(from, asset, holders, *amount)?;
            println!("deposited {total} of {asset} across {} holders", holders.len());
            Ok(())
        }),
        Commands::Withdraw { from, asset } => with_ledger(cli, true, |ledger| {
            let amount = ledger.withdraw(from, asset)?;
            println!("withdrew {amount} of {asset} to {from}");
            Ok(())
        }),
        Commands::Sign {
            sk_hex,
            asset,
            recipient,
        } => with_ledger(cli, false, |ledger| {
            let signer = CheckSigner::from_hex(sk_hex).context("parse --sk-hex")?;
            let sig = signer.sign_authorization(
                &ledger.identity(),
                asset,
                recipient,
                ledger.convention(),
            )?;
            println!("{sig}");
            Ok(())
        }),
        Commands::Redeem { from, asset, sig } => with_ledger(cli, true, |ledger| {
            let r = ledger.redeem(from, asset, sig)?;
            println!("redeemed {} of {asset} from {} to {}", r.amount, r.signer, r.recipient);
            Ok(())
        }),
        Commands::RedeemFor {
            from,
            asset,
            recipient,
            sig,
        } => with_ledger(cli, true, |ledger| {
            let r = ledger.redeem_for(from, asset, recipient, sig)?;
            println!("redeemed {} of {asset} from {} to {}", r.amount, r.signer, r.recipient);
            Ok(())
        }),
        Commands::Balance { asset, holder } => with_ledger(cli, false, |ledger| {
            println!("ledger: {}", ledger.balance_of(asset, holder));
            println!("wallet: {}", ledger.gateway().balance_of(asset, holder)?);
            println!("custody: {}", ledger.custody(asset)?);
            Ok(())
        }),
        Commands::Snapshot { out } => with_ledger(cli, false, |ledger| {
            let json = serde_json::to_string_pretty(&ledger.snapshot())?;
            match out {
                Some(path) => fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(())
        }),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(&cli)
}
