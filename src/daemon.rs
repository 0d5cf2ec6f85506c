//! The interface to the external Lightning daemon.
//!
//! The hub never talks to the network itself; it drives whatever daemon actually holds the
//! channels through [`LightningRpc`]. Implementations wrap a unix-socket or HTTP RPC client;
//! tests wrap an in-process mock.

use bitcoin::secp256k1::{PublicKey, SecretKey};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::{PaymentHash, Preimage};

/// What an invoice commits its description to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceDescription {
	/// A plain description embedded in the invoice.
	Direct(String),
	/// The hex SHA-256 of an out-of-band description, e.g. lnurl-pay metadata.
	Hash(String),
}

/// Request to create a BOLT11 invoice on the daemon.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
	/// Invoice amount.
	pub msat: u64,
	/// Daemon-side label, unique per invoice.
	pub label: String,
	/// Description or description hash.
	pub description: InvoiceDescription,
	/// Seconds until the invoice expires.
	pub expiry_secs: u64,
	/// The preimage the invoice commits to. Chosen by us, never by the daemon, so the
	/// interceptor can resolve the HTLC without asking anyone.
	pub preimage: Preimage,
	/// Private key of the phantom hop the routing hint starts from.
	pub hint_key: SecretKey,
	/// Short channel id of the shadow channel in the routing hint.
	pub hint_scid: u64,
}

/// A freshly issued invoice.
#[derive(Debug, Clone)]
pub struct IssuedInvoice {
	/// The encoded invoice.
	pub bolt11: String,
	/// Its payment hash.
	pub payment_hash: PaymentHash,
}

/// One hop of a routing hint in a decoded invoice.
#[derive(Debug, Clone)]
pub struct RouteHint {
	/// The node the hinted channel starts from.
	pub src_node: PublicKey,
	/// The hinted channel.
	pub short_channel_id: u64,
}

/// The fields of a decoded BOLT11 invoice the hub cares about.
#[derive(Debug, Clone)]
pub struct DecodedInvoice {
	/// Payment hash.
	pub payment_hash: PaymentHash,
	/// Amount, absent for amountless invoices.
	pub msat: Option<u64>,
	/// Description, if the invoice carries one directly.
	pub description: Option<String>,
	/// Description hash, if the invoice commits to one instead.
	pub description_hash: Option<String>,
	/// The destination node.
	pub payee: PublicKey,
	/// First hop of each routing hint.
	pub route_hints: Vec<RouteHint>,
	/// Invoice creation time, unix seconds.
	pub created_at: u64,
	/// Seconds from creation until expiry.
	pub expiry_secs: u64,
}

/// Request to pay an invoice.
#[derive(Debug, Clone)]
pub struct PayRequest {
	/// The invoice to pay.
	pub bolt11: String,
	/// Explicit amount for amountless invoices; must be `None` otherwise.
	pub msat: Option<u64>,
	/// Daemon-side label for the attempt.
	pub label: String,
	/// Abort routes costing more than this percentage of the amount in fees.
	pub max_fee_percent: f64,
	/// Route-selection bias toward cheap vs. reliable, daemon-defined scale.
	pub risk_factor: u32,
	/// Amount under which the fee percentage cap is not enforced.
	pub exempt_fee_msat: u64,
}

/// Outcome of a `pay` call that returned at all.
#[derive(Debug, Clone)]
pub enum PayOutcome {
	/// The payment settled.
	Complete {
		/// Routing fees actually paid.
		fees_msat: u64,
		/// Proof of payment.
		preimage: Preimage,
	},
	/// The daemon is still trying. Only the sent-payments list can tell the final outcome.
	Pending,
	/// The daemon gave up.
	Failed,
}

/// Status of one attempt in the daemon's sent-payments list.
#[derive(Debug, Clone)]
pub enum SentPaymentStatus {
	/// The attempt settled.
	Complete {
		/// Routing fees paid.
		fees_msat: u64,
		/// Proof of payment.
		preimage: Preimage,
	},
	/// Still in flight.
	Pending,
	/// Failed for good.
	Failed,
}

/// Errors surfaced by a [`LightningRpc`] implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
	/// The call did not come back in time. Says nothing about whether the operation ran.
	Timeout {
		/// How long we waited.
		secs: u64,
	},
	/// The daemon rejected the call.
	Command {
		/// Daemon-defined error code.
		code: i64,
		/// Daemon-provided message.
		message: String,
	},
	/// The connection dropped mid-call. Says nothing about whether the operation ran.
	ConnectionBroken,
	/// The daemon answered with something we could not interpret.
	BadResponse(String),
}

impl fmt::Display for RpcError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RpcError::Timeout { secs } => {
				write!(f, "operation did not respond in {secs}s, will check its status later")
			},
			RpcError::Command { code, message } => write!(f, "daemon error {code}: {message}"),
			RpcError::ConnectionBroken => f.write_str("connection to daemon lost"),
			RpcError::BadResponse(what) => write!(f, "unintelligible daemon response: {what}"),
		}
	}
}

impl std::error::Error for RpcError {}

impl RpcError {
	pub(crate) fn timeout(after: Duration) -> RpcError {
		RpcError::Timeout { secs: after.as_secs() }
	}
}

/// The Lightning daemon the hub settles against.
///
/// Object safe; async methods return boxed futures so the hub can hold a `dyn LightningRpc`.
pub trait LightningRpc: Send + Sync {
	/// Our node's public key. Cached by implementations; must not block.
	fn node_id(&self) -> PublicKey;

	/// Creates an invoice with our preimage and shadow routing hint.
	fn create_invoice(
		&self, req: CreateInvoice,
	) -> Pin<Box<dyn Future<Output = Result<IssuedInvoice, RpcError>> + Send + '_>>;

	/// Decodes a BOLT11 invoice without paying it.
	fn decode_invoice(
		&self, bolt11: String,
	) -> Pin<Box<dyn Future<Output = Result<DecodedInvoice, RpcError>> + Send + '_>>;

	/// Pays an invoice. May block for as long as the daemon keeps retrying routes.
	fn pay(
		&self, req: PayRequest,
	) -> Pin<Box<dyn Future<Output = Result<PayOutcome, RpcError>> + Send + '_>>;

	/// All attempts the daemon has on record for the given payment hash. An empty list means
	/// no attempt was ever made.
	fn list_sent_payments(
		&self, hash: PaymentHash,
	) -> Pin<Box<dyn Future<Output = Result<Vec<SentPaymentStatus>, RpcError>> + Send + '_>>;
}

/// Type alias for a dynamic [`LightningRpc`] trait object.
pub type DynLightningRpc = dyn LightningRpc + Send + Sync;
