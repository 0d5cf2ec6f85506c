//! The settlement worker.
//!
//! Everything that must happen after a synchronous decision was already given out goes through
//! here as a job on one queue: dispatching `pay` calls, crediting intercepted HTLCs, and
//! re-checking stuck payments. Handlers hit the idempotent ledger settle paths, so a job
//! running twice is harmless, and every failure is logged rather than lost in a detached task.

use tokio::sync::mpsc;

use std::sync::Arc;

use crate::payments::PaymentsEngine;
use crate::{AccountId, PaymentHash, Preimage};

#[derive(Debug)]
pub(crate) enum SettlementJob {
	/// Run the `pay` RPC for an already-reserved outbound payment and settle the outcome.
	DispatchPay {
		hash: PaymentHash,
		bolt11: String,
		msat: u64,
		/// Whether the invoice itself carries no amount and `msat` must go on the RPC.
		amountless: bool,
	},
	/// Credit an incoming payment the interceptor already resolved.
	CreditIncoming {
		user_id: AccountId,
		msat: u64,
		description: Option<String>,
		hash: PaymentHash,
		preimage: Preimage,
		tag: Option<String>,
		trigger_message: Option<i64>,
		comment: Option<String>,
	},
	/// Reconcile a possibly stuck payment against the daemon's sent-payments list.
	Recheck { hash: PaymentHash },
}

/// Submission side of the settlement queue. Cheap to clone.
#[derive(Clone)]
pub(crate) struct SettlementHandle {
	tx: mpsc::UnboundedSender<SettlementJob>,
}

impl SettlementHandle {
	pub(crate) fn channel() -> (SettlementHandle, mpsc::UnboundedReceiver<SettlementJob>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(SettlementHandle { tx }, rx)
	}

	pub(crate) fn submit(&self, job: SettlementJob) {
		if self.tx.send(job).is_err() {
			// Only possible during shutdown, once the worker is gone.
			log::error!("settlement worker gone, job dropped");
		}
	}
}

/// Spawns the worker onto the current runtime and returns its handle.
pub(crate) fn spawn_worker(engine: Arc<PaymentsEngine>) -> SettlementHandle {
	let (handle, mut rx) = SettlementHandle::channel();
	tokio::spawn(async move {
		while let Some(job) = rx.recv().await {
			engine.run_job(job).await;
		}
		log::debug!("settlement queue closed, worker exiting");
	});
	handle
}
