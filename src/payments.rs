//! The payment engine: outbound Lightning payments, internal transfers and proxied transfers.
//!
//! Outbound payments are two-phase. `pay_invoice` synchronously reserves the funds as a
//! pending ledger row and hands a `DispatchPay` job to the settlement worker; the worker runs
//! the `pay` RPC, which may take minutes, and settles the row from its outcome. An RPC error
//! or timeout is never taken as a failure on its own: the row is only deleted once the
//! daemon's own sent-payments list confirms the payment failed (or was never attempted), so a
//! user cannot be refunded money that is still in flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;

use crate::daemon::{
	DecodedInvoice, DynLightningRpc, PayOutcome, PayRequest, RpcError, SentPaymentStatus,
};
use crate::ledger::{Ledger, LedgerError, ProxyTransfer, Transfer, PROXY_ACCOUNT};
use crate::notifier::{DynNotifier, PaymentEvent};
use crate::settlement::{SettlementHandle, SettlementJob};
use crate::shadow::{ShadowDirectory, ShadowToken};
use crate::{AccountId, PaymentHash, Preimage};

/// Below this amount the flat part of the fee reserve kicks in, matching the daemon's
/// fee-exemption floor.
const FEE_EXEMPT_FLOOR_MSAT: u64 = 1_000_000;
const FLAT_RESERVE_MSAT: u64 = 5_000;
const MAX_FEE_PERCENT: f64 = 0.5;
const RISK_FACTOR: u32 = 3;

/// Errors which may occur when sending a payment.
#[derive(Debug)]
pub enum PayError {
	/// No amount given and none in the invoice, or the amount is zero.
	InvalidAmount,
	/// The payer and the payee are the same account.
	SelfPayment,
	/// The payer cannot cover amount plus fee reserve.
	InsufficientBalance {
		/// How much was missing, in millisatoshi.
		missing_msat: u64,
	},
	/// A payment with this hash is already on the books.
	PaymentInFlight,
	/// The invoice points at our node but we have no record of issuing it.
	UnknownInternalInvoice,
	/// Less than the invoiced amount was offered for one of our own invoices.
	AmountBelowInvoice {
		/// The invoiced amount.
		expected_msat: u64,
	},
	/// More than twice the invoiced amount was offered for one of our own invoices.
	AmountAboveDouble {
		/// The invoiced amount.
		expected_msat: u64,
	},
	/// The ledger refused or failed.
	Ledger(LedgerError),
	/// The daemon refused or failed.
	Rpc(RpcError),
}

impl fmt::Display for PayError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			PayError::InvalidAmount => f.write_str("no valid amount for this payment"),
			PayError::SelfPayment => f.write_str("refusing to pay yourself"),
			PayError::InsufficientBalance { missing_msat } => {
				write!(f, "insufficient balance, {missing_msat} msat missing")
			},
			PayError::PaymentInFlight => f.write_str("payment already in course"),
			PayError::UnknownInternalInvoice => {
				f.write_str("invoice points at us but we did not issue it")
			},
			PayError::AmountBelowInvoice { expected_msat } => {
				write!(f, "invoice asks for {expected_msat} msat, offered less")
			},
			PayError::AmountAboveDouble { expected_msat } => {
				write!(f, "offered more than double the invoiced {expected_msat} msat")
			},
			PayError::Ledger(e) => write!(f, "{e}"),
			PayError::Rpc(e) => write!(f, "{e}"),
		}
	}
}

impl std::error::Error for PayError {}

impl From<LedgerError> for PayError {
	fn from(e: LedgerError) -> PayError {
		match e {
			LedgerError::InsufficientBalance { missing_msat } => {
				PayError::InsufficientBalance { missing_msat }
			},
			LedgerError::PaymentInFlight => PayError::PaymentInFlight,
			other => PayError::Ledger(other),
		}
	}
}

impl From<RpcError> for PayError {
	fn from(e: RpcError) -> PayError {
		PayError::Rpc(e)
	}
}

/// What to hold back on top of the amount while a payment is in flight. Replaced by the real
/// fee at settlement.
pub(crate) fn fee_reserve_msat(amount_msat: u64) -> u64 {
	let mut reserve = amount_msat / 200;
	if amount_msat < FEE_EXEMPT_FLOOR_MSAT {
		reserve += FLAT_RESERVE_MSAT;
	}
	reserve
}

pub(crate) struct PaymentsEngine {
	ledger: Arc<Ledger>,
	rpc: Arc<DynLightningRpc>,
	notifier: Arc<DynNotifier>,
	shadow: Arc<ShadowDirectory>,
	node_id: PublicKey,
	pay_timeout: Duration,
}

impl PaymentsEngine {
	pub(crate) fn new(
		ledger: Arc<Ledger>, rpc: Arc<DynLightningRpc>, notifier: Arc<DynNotifier>,
		shadow: Arc<ShadowDirectory>, pay_timeout: Duration,
	) -> PaymentsEngine {
		let node_id = rpc.node_id();
		PaymentsEngine { ledger, rpc, notifier, shadow, node_id, pay_timeout }
	}

	pub(crate) async fn run_job(&self, job: SettlementJob) {
		match job {
			SettlementJob::DispatchPay { hash, bolt11, msat, amountless } => {
				self.dispatch_pay(hash, bolt11, msat, amountless).await;
			},
			SettlementJob::CreditIncoming {
				user_id,
				msat,
				description,
				hash,
				preimage,
				tag,
				trigger_message,
				comment,
			} => {
				match self.ledger.credit_incoming(
					user_id,
					msat,
					description.as_deref(),
					hash,
					preimage,
					tag.as_deref(),
				) {
					Ok(()) => {
						log::info!("credited {msat} msat to account {user_id} for {hash}");
						self.notifier
							.notify(
								user_id,
								PaymentEvent::PaymentReceived {
									msat,
									hash,
									comment,
									trigger_message,
								},
							)
							.await;
					},
					Err(e) => {
						// The HTLC is already claimed; this must be retried by hand.
						log::error!("FAILED to credit {msat} msat to {user_id} for {hash}: {e}");
					},
				}
			},
			SettlementJob::Recheck { hash } => self.recheck_payment(hash).await,
		}
	}

	pub(crate) async fn pay_invoice(
		&self, payer: AccountId, bolt11: &str, fallback_msat: u64, jobs: &SettlementHandle,
	) -> Result<PaymentHash, PayError> {
		let decoded = self.rpc.decode_invoice(bolt11.to_owned()).await?;
		let msat = match decoded.msat {
			Some(msat) => msat,
			None if fallback_msat > 0 => fallback_msat,
			None => return Err(PayError::InvalidAmount),
		};
		if msat == 0 {
			return Err(PayError::InvalidAmount);
		}

		if decoded.payee == self.node_id {
			return self.pay_own_invoice(payer, &decoded, msat).await;
		}

		self.ledger.record_transaction(&Transfer {
			from: Some(payer),
			to: None,
			amount_msat: msat,
			fee_reserve_msat: fee_reserve_msat(msat),
			description: decoded.description.clone(),
			payment_hash: decoded.payment_hash,
			tag: None,
			pending: true,
			trigger_message: None,
		})?;
		log::info!("account {payer} paying {} msat to {}", msat, decoded.payment_hash);

		jobs.submit(SettlementJob::DispatchPay {
			hash: decoded.payment_hash,
			bolt11: bolt11.to_owned(),
			msat,
			amountless: decoded.msat.is_none(),
		});
		Ok(decoded.payment_hash)
	}

	/// An invoice we issued ourselves never leaves the hub: settle it as an internal transfer
	/// against the shadow record the invoice's routing hint points at.
	async fn pay_own_invoice(
		&self, payer: AccountId, decoded: &DecodedInvoice, msat: u64,
	) -> Result<PaymentHash, PayError> {
		let hint = decoded.route_hints.first().ok_or(PayError::UnknownInternalInvoice)?;
		let token = ShadowToken::from_scid(hint.short_channel_id);
		let data = self.shadow.lookup(&token).ok_or(PayError::UnknownInternalInvoice)?;

		if data.user_id == payer {
			return Err(PayError::SelfPayment);
		}
		if msat < data.msat {
			return Err(PayError::AmountBelowInvoice { expected_msat: data.msat });
		}
		if msat > 2 * data.msat {
			return Err(PayError::AmountAboveDouble { expected_msat: data.msat });
		}

		let hash = decoded.payment_hash;
		self.ledger.record_transaction(&Transfer {
			from: Some(payer),
			to: Some(data.user_id),
			amount_msat: data.msat,
			fee_reserve_msat: 0,
			description: data.description.clone(),
			payment_hash: hash,
			tag: data.tag.clone(),
			pending: true,
			trigger_message: None,
		})?;
		self.ledger.credit_incoming(
			data.user_id,
			data.msat,
			data.description.as_deref(),
			hash,
			data.preimage,
			data.tag.as_deref(),
		)?;
		log::info!("settled own invoice {hash} internally, {payer} -> {}", data.user_id);

		self.payment_succeeded(hash, 0, data.preimage).await;
		self.notifier
			.notify(
				data.user_id,
				PaymentEvent::PaymentReceived {
					msat: data.msat,
					hash,
					comment: data.comment.clone(),
					trigger_message: data.trigger_message,
				},
			)
			.await;
		self.shadow.delete(&token);
		Ok(hash)
	}

	pub(crate) async fn send_internally(
		&self, payer: AccountId, payee: AccountId, msat: u64, description: Option<&str>,
		fixed_hash: Option<PaymentHash>, tag: Option<&str>,
	) -> Result<PaymentHash, PayError> {
		if payer == payee {
			return Err(PayError::SelfPayment);
		}
		if msat == 0 {
			return Err(PayError::InvalidAmount);
		}

		let hash = fixed_hash.unwrap_or_else(PaymentHash::random);
		self.ledger.record_transaction(&Transfer {
			from: Some(payer),
			to: Some(payee),
			amount_msat: msat,
			fee_reserve_msat: 0,
			description: description.map(str::to_owned),
			payment_hash: hash,
			tag: tag.map(str::to_owned),
			pending: false,
			trigger_message: None,
		})?;
		log::info!("internal transfer of {msat} msat, {payer} -> {payee}");

		self.notifier
			.notify(
				payee,
				PaymentEvent::PaymentReceived {
					msat,
					hash,
					comment: None,
					trigger_message: None,
				},
			)
			.await;
		Ok(hash)
	}

	pub(crate) async fn send_through_proxy(
		&self, transfer: ProxyTransfer,
	) -> Result<(), PayError> {
		if transfer.payer == transfer.payee || transfer.payee == PROXY_ACCOUNT {
			return Err(PayError::SelfPayment);
		}
		if transfer.amount_msat == 0 {
			return Err(PayError::InvalidAmount);
		}
		self.ledger.proxy_transfer(&transfer)?;
		log::info!(
			"proxied {} msat, {} -> {} via clearing account",
			transfer.amount_msat,
			transfer.payer,
			transfer.payee
		);

		self.notifier
			.notify(
				transfer.payee,
				PaymentEvent::PaymentReceived {
					msat: transfer.amount_msat,
					hash: transfer.target_hash,
					comment: None,
					trigger_message: transfer.target_trigger,
				},
			)
			.await;
		Ok(())
	}

	async fn dispatch_pay(&self, hash: PaymentHash, bolt11: String, msat: u64, amountless: bool) {
		let req = PayRequest {
			bolt11,
			msat: if amountless { Some(msat) } else { None },
			label: format!("hub.{hash}"),
			max_fee_percent: MAX_FEE_PERCENT,
			risk_factor: RISK_FACTOR,
			exempt_fee_msat: FLAT_RESERVE_MSAT,
		};
		match tokio::time::timeout(self.pay_timeout, self.rpc.pay(req)).await {
			Ok(Ok(PayOutcome::Complete { fees_msat, preimage })) => {
				self.payment_succeeded(hash, fees_msat, preimage).await;
			},
			Ok(Ok(PayOutcome::Pending)) => {
				log::warn!("pay {hash} still pending after RPC returned, rechecking");
				self.recheck_payment(hash).await;
			},
			Ok(Ok(PayOutcome::Failed)) => {
				// Trust but verify: the daemon may have a settled attempt on record even
				// when the last one failed.
				self.recheck_payment(hash).await;
			},
			Ok(Err(e)) => {
				log::warn!("pay {hash} errored ({e}), rechecking");
				self.recheck_payment(hash).await;
			},
			Err(_) => {
				let e = RpcError::timeout(self.pay_timeout);
				log::warn!("pay {hash}: {e}. rechecking");
				self.recheck_payment(hash).await;
			},
		}
	}

	/// Reconciles a pending payment against what the daemon has on record. A payment is only
	/// failed here once the daemon confirms it: either every attempt failed, or no attempt was
	/// ever made. Anything still in flight stays pending.
	pub(crate) async fn recheck_payment(&self, hash: PaymentHash) {
		let attempts = match self.rpc.list_sent_payments(hash).await {
			Ok(attempts) => attempts,
			Err(e) => {
				log::error!("cannot list attempts for {hash}: {e}. leaving it pending");
				return;
			},
		};

		if attempts.is_empty() {
			log::info!("no attempt on record for {hash}, failing it");
			self.payment_failed(hash).await;
			return;
		}

		let mut all_failed = true;
		for attempt in attempts {
			match attempt {
				SentPaymentStatus::Complete { fees_msat, preimage } => {
					self.payment_succeeded(hash, fees_msat, preimage).await;
					return;
				},
				SentPaymentStatus::Pending => all_failed = false,
				SentPaymentStatus::Failed => {},
			}
		}
		if all_failed {
			self.payment_failed(hash).await;
		} else {
			log::debug!("{hash} still in flight, leaving it pending");
		}
	}

	async fn payment_succeeded(&self, hash: PaymentHash, fees_msat: u64, preimage: Preimage) {
		match self.ledger.settle_success(hash, fees_msat, preimage) {
			Ok(Some(settled)) => {
				log::info!("payment {hash} settled, fees {fees_msat} msat");
				if let Some(account) = settled.account {
					let amount = self.find_sent_amount(account, hash);
					self.notifier
						.notify(
							account,
							PaymentEvent::PaymentSent {
								msat: amount,
								fee_msat: fees_msat,
								hash,
								preimage,
								trigger_message: settled.trigger_message,
							},
						)
						.await;
				}
			},
			Ok(None) => log::debug!("success for {hash} already settled, ignoring"),
			Err(e) => log::error!("FAILED to settle success for {hash}: {e}"),
		}
	}

	async fn payment_failed(&self, hash: PaymentHash) {
		match self.ledger.settle_failure(hash) {
			Ok(Some(settled)) => {
				log::info!("payment {hash} failed, funds returned");
				if let Some(account) = settled.account {
					self.notifier
						.notify(
							account,
							PaymentEvent::PaymentFailed {
								hash,
								trigger_message: settled.trigger_message,
							},
						)
						.await;
				}
			},
			Ok(None) => log::debug!("failure for {hash} already settled, ignoring"),
			Err(e) => log::error!("FAILED to settle failure for {hash}: {e}"),
		}
	}

	fn find_sent_amount(&self, account: AccountId, hash: PaymentHash) -> u64 {
		match self.ledger.list_transactions(account, 50, 0, crate::ledger::Direction::Out, None) {
			Ok(entries) => entries
				.iter()
				.find(|e| e.payment_hash == hash)
				.map(|e| e.amount_msat.unsigned_abs())
				.unwrap_or(0),
			Err(_) => 0,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fee_reserve_policy() {
		// Flat floor below 1M msat on top of the 0.5%.
		assert_eq!(fee_reserve_msat(1_000), 5_005);
		assert_eq!(fee_reserve_msat(999_999), 4_999 + 5_000);
		// Pure percentage above it.
		assert_eq!(fee_reserve_msat(1_000_000), 5_000);
		assert_eq!(fee_reserve_msat(100_000_000), 500_000);
	}
}
