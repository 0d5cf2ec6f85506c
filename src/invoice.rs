//! The invoice issuer.
//!
//! Every invoice we hand out commits to a preimage we chose and carries a routing hint through
//! a shadow channel registered in the [`ShadowDirectory`]. The hint's source node is a key
//! derived deterministically per user, so the same user always appears behind the same phantom
//! hop. Issuance is rate limited for small amounts to keep invoice spam from filling the
//! daemon's database.

use chrono::{DateTime, Utc};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::{
	CreateInvoice, DynLightningRpc, InvoiceDescription, IssuedInvoice, RpcError,
};
use crate::ephemeral::EphemeralStore;
use crate::ledger::{Account, LedgerError};
use crate::shadow::{ShadowChannelData, ShadowDirectory};
use crate::{AccountId, Preimage, invoice_hint_key};

/// How long we wait for the daemon to sign an invoice.
const CREATE_TIMEOUT: Duration = Duration::from_secs(40);

/// Per-day caps on small invoices: an invoice of up to the tier's amount counts against the
/// tier and every larger one.
const SPAM_TIERS: [(u64, u32); 3] = [(1_000, 1), (10_000, 3), (100_000, 10)];

/// Errors which may occur when issuing an invoice.
#[derive(Debug)]
pub enum IssueError {
	/// The amount is zero.
	InvalidAmount,
	/// No account with this id exists.
	UnknownAccount(AccountId),
	/// The user issued too many small invoices today. Counters reset at UTC midnight.
	RateLimited {
		/// The tier that was exhausted, as its amount ceiling in millisatoshi.
		tier_msat: u64,
		/// How many invoices up to that amount a user gets per day.
		per_day: u32,
	},
	/// Looking up the account failed.
	Ledger(LedgerError),
	/// The daemon refused or failed.
	Rpc(RpcError),
}

impl fmt::Display for IssueError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			IssueError::InvalidAmount => f.write_str("invoice amount must be positive"),
			IssueError::UnknownAccount(id) => write!(f, "no account {id}"),
			IssueError::RateLimited { tier_msat, per_day } => write!(
				f,
				"at most {per_day} invoices of up to {tier_msat} msat per day, try again tomorrow"
			),
			IssueError::Ledger(e) => write!(f, "{e}"),
			IssueError::Rpc(e) => write!(f, "{e}"),
		}
	}
}

impl std::error::Error for IssueError {}

impl From<LedgerError> for IssueError {
	fn from(e: LedgerError) -> IssueError {
		IssueError::Ledger(e)
	}
}

impl From<RpcError> for IssueError {
	fn from(e: RpcError) -> IssueError {
		IssueError::Rpc(e)
	}
}

/// What to put in a new invoice.
#[derive(Debug, Clone, Default)]
pub struct MakeInvoiceArgs {
	/// Invoice amount. Must be positive; the interceptor will accept up to twice this.
	pub msat: u64,
	/// Plain description to embed.
	pub description: Option<String>,
	/// Hex SHA-256 of an out-of-band description; wins over `description` when both are set.
	pub description_hash: Option<String>,
	/// Ledger tag for the eventual credit.
	pub tag: Option<String>,
	/// Expiry override; the hub default applies when absent.
	pub expiry: Option<Duration>,
	/// Front-end message this invoice was requested in, if any.
	pub trigger_message: Option<i64>,
	/// Payer comment to carry through to the receive notification.
	pub comment: Option<String>,
	/// Skip the small-invoice rate limit. For internal flows like lnurl withdrawals against
	/// other hubs, never for user requests.
	pub ignore_rate_limit: bool,
}

pub(crate) struct InvoiceIssuer {
	rpc: Arc<DynLightningRpc>,
	shadow: Arc<ShadowDirectory>,
	ephemeral: Arc<EphemeralStore>,
	key_secret: String,
	default_expiry: Duration,
}

impl InvoiceIssuer {
	pub(crate) fn new(
		rpc: Arc<DynLightningRpc>, shadow: Arc<ShadowDirectory>,
		ephemeral: Arc<EphemeralStore>, key_secret: String, default_expiry: Duration,
	) -> InvoiceIssuer {
		InvoiceIssuer { rpc, shadow, ephemeral, key_secret, default_expiry }
	}

	pub(crate) async fn make_invoice(
		&self, user: &Account, args: MakeInvoiceArgs,
	) -> Result<IssuedInvoice, IssueError> {
		if args.msat == 0 {
			return Err(IssueError::InvalidAmount);
		}
		if !args.ignore_rate_limit {
			check_rate_limit(&self.ephemeral, user.id, args.msat)?;
		}

		let preimage = Preimage::random();
		let payment_hash = preimage.payment_hash();

		// Registered before the RPC so the invoice is claimable the moment it exists.
		let token = self.shadow.create(&ShadowChannelData {
			user_id: user.id,
			origin: user.origin,
			trigger_message: args.trigger_message,
			tag: args.tag,
			msat: args.msat,
			description: args.description.clone(),
			description_hash: args.description_hash.clone(),
			preimage,
			comment: args.comment,
		});

		let description = match args.description_hash {
			Some(hash) => InvoiceDescription::Hash(hash),
			None => InvoiceDescription::Direct(args.description.unwrap_or_default()),
		};
		let req = CreateInvoice {
			msat: args.msat,
			label: format!("hub.{}.{payment_hash}", user.id),
			description,
			expiry_secs: args.expiry.unwrap_or(self.default_expiry).as_secs(),
			preimage,
			hint_key: invoice_hint_key(user.id, &self.key_secret),
			hint_scid: token.to_scid(),
		};
		let issued = match tokio::time::timeout(CREATE_TIMEOUT, self.rpc.create_invoice(req)).await
		{
			Ok(Ok(issued)) => issued,
			Ok(Err(e)) => {
				self.shadow.delete(&token);
				return Err(e.into());
			},
			Err(_) => {
				self.shadow.delete(&token);
				return Err(RpcError::timeout(CREATE_TIMEOUT).into());
			},
		};

		if issued.payment_hash != payment_hash {
			// The daemon ignored our preimage; the invoice would be unsettleable.
			self.shadow.delete(&token);
			return Err(IssueError::Rpc(RpcError::BadResponse(format!(
				"invoice hash {} does not match requested preimage",
				issued.payment_hash
			))));
		}
		log::info!("issued invoice {payment_hash} for account {}", user.id);
		Ok(issued)
	}

}

/// An invoice counts against its own tier and every larger one, so a flood of dust invoices
/// cannot hide inside the bigger allowances.
fn check_rate_limit(
	store: &EphemeralStore, user: AccountId, msat: u64,
) -> Result<(), IssueError> {
	let now = Utc::now();
	let ttl = until_utc_midnight(now);
	for (tier_msat, per_day) in SPAM_TIERS {
		if msat <= tier_msat {
			let key = format!("invspam:{tier_msat}:{user}:{}", now.format("%Y%m%d"));
			if store.incr(&key, ttl) > u64::from(per_day) {
				return Err(IssueError::RateLimited { tier_msat, per_day });
			}
		}
	}
	Ok(())
}

fn until_utc_midnight(now: DateTime<Utc>) -> Duration {
	let next_midnight =
		now.date_naive().succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0));
	match next_midnight {
		Some(t) => (t - now.naive_utc()).to_std().unwrap_or(Duration::from_secs(24 * 60 * 60)),
		// Only reachable at the end of representable time.
		None => Duration::from_secs(24 * 60 * 60),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn tiny_invoices_once_a_day() {
		let store = EphemeralStore::new();
		assert!(check_rate_limit(&store, 1, 800).is_ok());
		match check_rate_limit(&store, 1, 900) {
			Err(IssueError::RateLimited { tier_msat: 1_000, per_day: 1 }) => {},
			other => panic!("expected the 1k tier to trip, got {other:?}"),
		}
		// Other users are unaffected.
		assert!(check_rate_limit(&store, 2, 800).is_ok());
	}

	#[test]
	fn mid_tier_allows_three() {
		let store = EphemeralStore::new();
		for _ in 0..3 {
			assert!(check_rate_limit(&store, 1, 9_000).is_ok());
		}
		assert!(matches!(
			check_rate_limit(&store, 1, 9_000),
			Err(IssueError::RateLimited { tier_msat: 10_000, per_day: 3 })
		));
	}

	#[test]
	fn small_invoices_count_against_larger_tiers_too() {
		let store = EphemeralStore::new();
		assert!(check_rate_limit(&store, 1, 500).is_ok());
		assert!(check_rate_limit(&store, 1, 5_000).is_ok());
		assert!(check_rate_limit(&store, 1, 5_000).is_ok());
		// Three spent on the 10k tier already.
		assert!(matches!(check_rate_limit(&store, 1, 5_000), Err(IssueError::RateLimited { .. })));
		// The 100k tier still has headroom.
		assert!(check_rate_limit(&store, 1, 50_000).is_ok());
	}

	#[test]
	fn large_invoices_are_never_limited() {
		let store = EphemeralStore::new();
		for _ in 0..20 {
			assert!(check_rate_limit(&store, 1, 500_000).is_ok());
		}
	}

	#[test]
	fn midnight_ttl_is_bounded() {
		let early = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 1).unwrap();
		let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 30).unwrap();
		assert!(until_utc_midnight(early) > Duration::from_secs(23 * 60 * 60));
		assert!(until_utc_midnight(late) < Duration::from_secs(60));
	}
}
