//! Resolution of intercepted incoming HTLCs.
//!
//! The daemon holds every incoming HTLC whose next hop it does not recognize and asks us what
//! to do. If the onion points at one of our shadow channels we settle the HTLC ourselves with
//! the preimage we picked at invoice time; anything else is waved through untouched. The
//! decision is made synchronously from in-memory state only, the ledger credit happens on the
//! settlement worker afterwards.

use std::sync::Arc;

use crate::settlement::{SettlementHandle, SettlementJob};
use crate::shadow::{ShadowDirectory, ShadowToken};
use crate::{PaymentHash, Preimage};

/// BOLT 4 `incorrect_or_unknown_payment_details`, the code the original custodial hubs fail
/// amount-mismatched HTLCs with.
const FAIL_AMOUNT_OUT_OF_RANGE: u16 = 16392;
/// PERM | 15, for HTLCs whose hash does not match the preimage on record.
const FAIL_INCORRECT_DETAILS: u16 = 16399;

/// An incoming HTLC as handed over by the daemon's interception hook.
#[derive(Debug, Clone)]
pub struct Htlc {
	/// Amount offered to the final hop.
	pub amount_msat: u64,
	/// The HTLC's payment hash.
	pub payment_hash: PaymentHash,
	/// Short channel id from the onion payload. `None` when the payload carries none or the
	/// daemon could not parse it.
	pub onion_scid: Option<u64>,
}

/// What the daemon should do with an intercepted HTLC.
#[derive(Debug, Clone, PartialEq)]
pub enum HtlcResolution {
	/// Not ours. Let the daemon forward or fail it as it normally would.
	Continue,
	/// Reject the HTLC with the given BOLT 4 failure code.
	Fail {
		/// Failure code to put in the update_fail message.
		failure_code: u16,
	},
	/// Claim the HTLC with this preimage. The owner's ledger credit is already queued.
	Resolve {
		/// The preimage the invoice committed to.
		preimage: Preimage,
	},
}

pub(crate) struct Interceptor {
	shadow: Arc<ShadowDirectory>,
	jobs: SettlementHandle,
}

impl Interceptor {
	pub(crate) fn new(shadow: Arc<ShadowDirectory>, jobs: SettlementHandle) -> Interceptor {
		Interceptor { shadow, jobs }
	}

	pub(crate) fn intercept(&self, htlc: &Htlc) -> HtlcResolution {
		// A zero scid is what our own invoices decode to when paid directly over a real
		// channel; not a shadow routing attempt.
		let scid = match htlc.onion_scid {
			None | Some(0) => return HtlcResolution::Continue,
			Some(scid) => scid,
		};

		let token = ShadowToken::from_scid(scid);
		let data = match self.shadow.lookup(&token) {
			Some(data) => data,
			None => return HtlcResolution::Continue,
		};

		// Exact payment or overpayment up to 2x is honored, anything else is refused so the
		// sender's mistake does not become ours.
		if htlc.amount_msat < data.msat || htlc.amount_msat > 2 * data.msat {
			log::warn!(
				"htlc {} carries {} msat, expected {} msat: failing",
				htlc.payment_hash,
				htlc.amount_msat,
				data.msat
			);
			return HtlcResolution::Fail { failure_code: FAIL_AMOUNT_OUT_OF_RANGE };
		}

		if data.preimage.payment_hash() != htlc.payment_hash {
			// Someone probing with a guessed hash against a live token.
			log::warn!("htlc {} does not match preimage on record: failing", htlc.payment_hash);
			return HtlcResolution::Fail { failure_code: FAIL_INCORRECT_DETAILS };
		}

		self.shadow.delete(&token);
		self.jobs.submit(SettlementJob::CreditIncoming {
			user_id: data.user_id,
			msat: htlc.amount_msat,
			description: data.description,
			hash: htlc.payment_hash,
			preimage: data.preimage,
			tag: data.tag,
			trigger_message: data.trigger_message,
			comment: data.comment,
		});
		HtlcResolution::Resolve { preimage: data.preimage }
	}
}
