//! Delivery of settlement outcomes to whatever front ends the accounts live on.
//!
//! The hub reports events in structured form and never formats user-facing text; rendering and
//! routing (Telegram, Discord, webhooks) is the implementor's business.

use std::future::Future;
use std::pin::Pin;

use crate::{AccountId, PaymentHash, Preimage};

/// A settlement outcome worth telling an account's owner about.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
	/// An outbound payment settled.
	PaymentSent {
		/// Amount paid, excluding fees.
		msat: u64,
		/// Routing fees paid.
		fee_msat: u64,
		/// Payment hash.
		hash: PaymentHash,
		/// Proof of payment.
		preimage: Preimage,
		/// Front-end message that started the payment, if any.
		trigger_message: Option<i64>,
	},
	/// An outbound payment failed for good and the reserved funds were returned.
	PaymentFailed {
		/// Payment hash.
		hash: PaymentHash,
		/// Front-end message that started the payment, if any.
		trigger_message: Option<i64>,
	},
	/// Funds arrived, through Lightning or an internal transfer.
	PaymentReceived {
		/// Amount credited.
		msat: u64,
		/// Payment hash.
		hash: PaymentHash,
		/// Payer comment, when one came along with the payment.
		comment: Option<String>,
		/// Front-end message the invoice was issued in reply to, if any.
		trigger_message: Option<i64>,
	},
}

/// Receives settlement events for delivery to account owners.
pub trait Notifier: Send + Sync {
	/// Delivers `event` to the owner of `account`. Failures are the implementor's to handle;
	/// the settlement engine does not retry.
	fn notify(
		&self, account: AccountId, event: PaymentEvent,
	) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Type alias for a dynamic [`Notifier`] trait object.
pub type DynNotifier = dyn Notifier + Send + Sync;

/// A [`Notifier`] that drops every event. Useful for tools that only query the ledger.
pub struct NullNotifier;

impl Notifier for NullNotifier {
	fn notify(
		&self, _account: AccountId, _event: PaymentEvent,
	) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
		Box::pin(async {})
	}
}
