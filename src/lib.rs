#![deny(missing_docs)]

//! A library implementing the internal ledger and payment-settlement engine of a custodial
//! Lightning wallet that multiplexes many users over a single node identity.
//!
//! All user funds live in one Lightning node; this crate tracks who owns what in a double-entry
//! SQLite ledger and settles payments against an external Lightning daemon reached through the
//! [`LightningRpc`] trait. Incoming payments are routed to users without real per-user channels:
//! invoices carry a routing hint through a fake "shadow" channel whose short channel id encodes a
//! random token, and the daemon's HTLC interception hook hands the HTLC to [`Hub::intercept_htlc`]
//! which resolves it with the stored preimage and credits the owner.
//!
//! This crate should do everything a custodial Lightning hub backend needs except the front end:
//! user-facing messages are delivered through the injected [`Notifier`] and the Lightning daemon
//! is reached through the injected [`LightningRpc`].

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::hex::{DisplayHex, FromHex};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub mod builder;
pub mod daemon;
mod ephemeral;
mod interceptor;
mod invoice;
mod ledger;
pub(crate) mod logging;
pub mod notifier;
mod payments;
mod settlement;
mod shadow;

use crate::daemon::DynLightningRpc;
use crate::interceptor::Interceptor;
use crate::invoice::InvoiceIssuer;
use crate::ledger::Ledger;
use crate::notifier::DynNotifier;
use crate::payments::PaymentsEngine;
use crate::settlement::{SettlementHandle, SettlementJob};

pub use crate::builder::{BuildError, HubBuilder};
pub use crate::daemon::{
	CreateInvoice, DecodedInvoice, InvoiceDescription, IssuedInvoice, LightningRpc, PayOutcome,
	PayRequest, RouteHint, RpcError, SentPaymentStatus,
};
pub use crate::ephemeral::EphemeralStore;
pub use crate::interceptor::{Htlc, HtlcResolution};
pub use crate::invoice::{IssueError, MakeInvoiceArgs};
pub use crate::ledger::{
	Account, Direction, LedgerEntry, LedgerError, PROXY_ACCOUNT, ProxyTransfer,
};
pub use crate::logging::LoggerType;
pub use crate::notifier::{Notifier, PaymentEvent};
pub use crate::payments::PayError;
pub use crate::shadow::{ShadowChannelData, ShadowDirectory, ShadowToken, format_scid, parse_scid};

/// Identifier of an account row in the ledger.
pub type AccountId = i64;

/// Where an account's owner lives. Determines which front end the [`Notifier`] should route
/// events to and is recorded alongside shadow channel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
	/// A Telegram user.
	Telegram,
	/// A Discord user.
	Discord,
	/// An account created through the HTTP API.
	Api,
	/// Internal accounts, e.g. the proxy clearing account.
	System,
}

impl Origin {
	pub(crate) fn as_str(&self) -> &'static str {
		match self {
			Origin::Telegram => "telegram",
			Origin::Discord => "discord",
			Origin::Api => "api",
			Origin::System => "system",
		}
	}

	pub(crate) fn from_db(s: &str) -> Option<Origin> {
		match s {
			"telegram" => Some(Origin::Telegram),
			"discord" => Some(Origin::Discord),
			"api" => Some(Origin::Api),
			"system" => Some(Origin::System),
			_ => None,
		}
	}
}

impl fmt::Display for Origin {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A payment hash, stored and displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
	/// A random hash for internal transfers that have no real HTLC behind them.
	pub fn random() -> PaymentHash {
		let mut bytes = [0u8; 32];
		rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
		PaymentHash(bytes)
	}
}

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.0.to_lower_hex_string())
	}
}

impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentHash({})", self.0.to_lower_hex_string())
	}
}

impl FromStr for PaymentHash {
	type Err = ParseHexError;

	fn from_str(s: &str) -> Result<PaymentHash, ParseHexError> {
		let bytes: [u8; 32] = FromHex::from_hex(s).map_err(|_| ParseHexError)?;
		Ok(PaymentHash(bytes))
	}
}

/// A payment preimage. Hashing it with SHA-256 yields the corresponding [`PaymentHash`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
	/// A fresh random preimage.
	pub fn random() -> Preimage {
		let mut bytes = [0u8; 32];
		rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
		Preimage(bytes)
	}

	/// The payment hash committing to this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
	}
}

impl fmt::Display for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.0.to_lower_hex_string())
	}
}

impl fmt::Debug for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Preimage({})", self.0.to_lower_hex_string())
	}
}

impl FromStr for Preimage {
	type Err = ParseHexError;

	fn from_str(s: &str) -> Result<Preimage, ParseHexError> {
		let bytes: [u8; 32] = FromHex::from_hex(s).map_err(|_| ParseHexError)?;
		Ok(Preimage(bytes))
	}
}

impl Serialize for Preimage {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0.to_lower_hex_string())
	}
}

impl<'de> Deserialize<'de> for Preimage {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Preimage, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(|_| serde::de::Error::custom("invalid preimage hex"))
	}
}

/// Error returned when parsing a hex-encoded hash or preimage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseHexError;

impl fmt::Display for ParseHexError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("expected 64 lowercase hex characters")
	}
}

impl std::error::Error for ParseHexError {}

/// Where the ledger database lives.
#[derive(Debug, Clone)]
pub enum StorageConfig {
	/// A SQLite database at the given path, created if missing.
	LocalSqlite(PathBuf),
	/// An in-memory database. State is lost on drop; intended for tests.
	InMemory,
}

/// Configuration for a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Ledger database location.
	pub storage: StorageConfig,
	/// Secret mixed into per-user invoice hint key derivation. Must stay stable across restarts
	/// or previously issued invoices become unclaimable.
	pub key_secret: String,
	/// Default expiry for issued invoices.
	pub invoice_expiry: Duration,
	/// How long shadow channel records are kept. Must be at least the invoice expiry.
	pub shadow_ttl: Duration,
	/// Ceiling on how long a single `pay` RPC may run before we fall back to reconciliation
	/// via the daemon's sent-payments list.
	pub pay_timeout: Duration,
	/// Where log output goes.
	pub logger: LoggerType,
}

impl Default for HubConfig {
	fn default() -> HubConfig {
		HubConfig {
			storage: StorageConfig::LocalSqlite(PathBuf::from("hub.sqlite3")),
			key_secret: String::new(),
			invoice_expiry: Duration::from_secs(24 * 60 * 60),
			shadow_ttl: Duration::from_secs(7 * 24 * 60 * 60),
			pay_timeout: Duration::from_secs(30 * 60),
			logger: LoggerType::LogFacade,
		}
	}
}

/// Errors which may occur when constructing a [`Hub`].
#[derive(Debug)]
pub enum InitFailure {
	/// Opening or migrating the ledger database failed.
	Ledger(LedgerError),
	/// The log file could not be opened.
	Logger,
	/// The configuration is inconsistent.
	Config(&'static str),
}

impl fmt::Display for InitFailure {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			InitFailure::Ledger(e) => write!(f, "failed to open ledger database: {e}"),
			InitFailure::Logger => f.write_str("failed to open log file"),
			InitFailure::Config(msg) => write!(f, "invalid configuration: {msg}"),
		}
	}
}

impl std::error::Error for InitFailure {}

impl From<LedgerError> for InitFailure {
	fn from(e: LedgerError) -> InitFailure {
		InitFailure::Ledger(e)
	}
}

struct HubImpl {
	ledger: Arc<Ledger>,
	issuer: InvoiceIssuer,
	interceptor: Interceptor,
	engine: Arc<PaymentsEngine>,
	jobs: SettlementHandle,
}

/// The ledger and settlement engine of a custodial Lightning hub.
///
/// `Hub` is cheaply cloneable and all methods take `&self`; share one instance between the
/// daemon's hook handlers and the front ends.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubImpl>,
}

impl Hub {
	/// Constructs a new [`Hub`].
	///
	/// Must be called from within a tokio runtime; the settlement worker is spawned onto it.
	/// Prefer [`HubBuilder`] unless you are wiring everything by hand.
	pub fn new(
		config: HubConfig, rpc: Arc<DynLightningRpc>, notifier: Arc<DynNotifier>,
	) -> Result<Hub, InitFailure> {
		if config.shadow_ttl < config.invoice_expiry {
			return Err(InitFailure::Config("shadow_ttl must cover the invoice expiry"));
		}
		logging::init(&config.logger).map_err(|()| InitFailure::Logger)?;

		let ledger = Arc::new(Ledger::open(&config.storage)?);
		let ephemeral = Arc::new(EphemeralStore::new());
		let shadow = Arc::new(ShadowDirectory::new(Arc::clone(&ephemeral), config.shadow_ttl));

		let engine = Arc::new(PaymentsEngine::new(
			Arc::clone(&ledger),
			Arc::clone(&rpc),
			Arc::clone(&notifier),
			Arc::clone(&shadow),
			config.pay_timeout,
		));
		let jobs = settlement::spawn_worker(Arc::clone(&engine));

		let issuer = InvoiceIssuer::new(
			Arc::clone(&rpc),
			Arc::clone(&shadow),
			ephemeral,
			config.key_secret,
			config.invoice_expiry,
		);
		let interceptor = Interceptor::new(shadow, jobs.clone());

		log::info!("hub ready, node {}", rpc.node_id());
		Ok(Hub { inner: Arc::new(HubImpl { ledger, issuer, interceptor, engine, jobs }) })
	}

	/// Fetches the account for the given (origin, origin id) pair, creating it if needed and
	/// refreshing its username.
	pub fn ensure_account(
		&self, origin: Origin, origin_id: &str, username: Option<&str>,
	) -> Result<Account, LedgerError> {
		self.inner.ledger.ensure_account(origin, origin_id, username)
	}

	/// Looks up an account by its ledger id.
	pub fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
		self.inner.ledger.get_account(id)
	}

	/// The account's exact balance in millisatoshi. May be temporarily reduced by pending
	/// outbound fee reserves.
	pub fn get_balance(&self, account: AccountId) -> Result<i64, LedgerError> {
		self.inner.ledger.get_balance(account)
	}

	/// The balance a user should treat as spendable. Above 1M sat a 1% haircut is applied to
	/// leave room for routing fees.
	pub fn usable_balance(&self, account: AccountId) -> Result<i64, LedgerError> {
		self.inner.ledger.usable_balance(account)
	}

	/// Net balance per tag for the account, skipping untagged entries.
	pub fn tagged_balances(&self, account: AccountId) -> Result<Vec<(String, i64)>, LedgerError> {
		self.inner.ledger.tagged_balances(account)
	}

	/// The account's transaction history, newest first.
	pub fn list_transactions(
		&self, account: AccountId, limit: u32, offset: u32, direction: Direction,
		tag: Option<&str>,
	) -> Result<Vec<LedgerEntry>, LedgerError> {
		self.inner.ledger.list_transactions(account, limit, offset, direction, tag)
	}

	/// Issues a BOLT11 invoice whose settlement will credit `user`.
	///
	/// The invoice carries a routing hint through a shadow channel; when the HTLC arrives the
	/// daemon must hand it to [`Hub::intercept_htlc`].
	pub async fn make_invoice(
		&self, user: AccountId, args: MakeInvoiceArgs,
	) -> Result<IssuedInvoice, IssueError> {
		let account =
			self.inner.ledger.get_account(user)?.ok_or(IssueError::UnknownAccount(user))?;
		self.inner.issuer.make_invoice(&account, args).await
	}

	/// Decides the fate of an intercepted incoming HTLC. Synchronous and sub-second: the ledger
	/// credit and owner notification run detached on the settlement worker.
	pub fn intercept_htlc(&self, htlc: &Htlc) -> HtlcResolution {
		self.inner.interceptor.intercept(htlc)
	}

	/// Pays a BOLT11 invoice from `payer`'s balance.
	///
	/// `fallback_msat` supplies the amount for amountless invoices. Payments to invoices we
	/// issued ourselves settle internally without touching the network. For external payments
	/// the returned hash identifies a pending debit which is settled asynchronously; the payer
	/// learns the outcome through the [`Notifier`].
	pub async fn pay_invoice(
		&self, payer: AccountId, bolt11: &str, fallback_msat: u64,
	) -> Result<PaymentHash, PayError> {
		self.inner.engine.pay_invoice(payer, bolt11, fallback_msat, &self.inner.jobs).await
	}

	/// Moves funds between two accounts without any Lightning involvement.
	pub async fn send_internally(
		&self, payer: AccountId, payee: AccountId, msat: u64, description: Option<&str>,
		fixed_hash: Option<PaymentHash>, tag: Option<&str>,
	) -> Result<PaymentHash, PayError> {
		self.inner.engine.send_internally(payer, payee, msat, description, fixed_hash, tag).await
	}

	/// Moves funds from payer to payee through the proxy clearing account, linking the two
	/// ledger legs by their payment hashes. Repeated calls with the same hashes accumulate.
	pub async fn send_through_proxy(&self, transfer: ProxyTransfer) -> Result<(), PayError> {
		self.inner.engine.send_through_proxy(transfer).await
	}

	/// Re-checks a possibly stuck outbound payment against the daemon's sent-payments list and
	/// settles it if the daemon reports a final outcome. Safe to call at any time.
	pub fn recheck_payment(&self, hash: PaymentHash) {
		self.inner.jobs.submit(SettlementJob::Recheck { hash });
	}
}

/// Derives the per-user secret key used as the source node of invoice routing hints.
///
/// Deterministic so that a restarted hub keeps honoring invoices issued before the restart.
pub(crate) fn invoice_hint_key(user: AccountId, secret: &str) -> bitcoin::secp256k1::SecretKey {
	let seed = sha256::Hash::hash(format!("invoicekeyseed:{user}:{secret}").as_bytes());
	// A SHA-256 output lands outside the curve order with probability ~2^-128.
	bitcoin::secp256k1::SecretKey::from_slice(&seed.to_byte_array())
		.expect("hash output is a valid scalar")
}
