use bitcoin::secp256k1::{PublicKey, Secp256k1};
use hub_ledger::notifier::{Notifier, PaymentEvent};
use hub_ledger::{
	AccountId, CreateInvoice, DecodedInvoice, Htlc, HtlcResolution, Hub, HubBuilder,
	InvoiceDescription, IssuedInvoice, LightningRpc, MakeInvoiceArgs, Origin, PayOutcome,
	PayRequest, PaymentHash, RouteHint, RpcError, SentPaymentStatus,
};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A stable identity for the hub's own node across all tests.
pub const HUB_NODE_ID: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
/// Some other node out there on the network.
pub const EXTERNAL_NODE_ID: &str =
	"02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

/// An in-process stand-in for the Lightning daemon. Invoices it "creates" are remembered so
/// they can be decoded later; `pay` outcomes and the sent-payments list are scripted by each
/// test.
pub struct MockLightningRpc {
	node_key: PublicKey,
	counter: AtomicU64,
	pub invoices: Mutex<HashMap<String, DecodedInvoice>>,
	pub pay_results: Mutex<VecDeque<Result<PayOutcome, RpcError>>>,
	pub sent_payments: Mutex<HashMap<PaymentHash, Vec<SentPaymentStatus>>>,
	pub pay_calls: AtomicUsize,
}

impl MockLightningRpc {
	pub fn new() -> MockLightningRpc {
		MockLightningRpc {
			node_key: PublicKey::from_str(HUB_NODE_ID).unwrap(),
			counter: AtomicU64::new(0),
			invoices: Mutex::new(HashMap::new()),
			pay_results: Mutex::new(VecDeque::new()),
			sent_payments: Mutex::new(HashMap::new()),
			pay_calls: AtomicUsize::new(0),
		}
	}

	pub fn decoded(&self, bolt11: &str) -> DecodedInvoice {
		self.invoices.lock().unwrap().get(bolt11).unwrap().clone()
	}

	/// Registers an invoice from some other node so the hub will treat paying it as an
	/// external payment.
	pub fn register_external_invoice(
		&self, bolt11: &str, hash: PaymentHash, msat: Option<u64>,
	) {
		let decoded = DecodedInvoice {
			payment_hash: hash,
			msat,
			description: Some("external invoice".to_owned()),
			description_hash: None,
			payee: PublicKey::from_str(EXTERNAL_NODE_ID).unwrap(),
			route_hints: vec![],
			created_at: now_unix(),
			expiry_secs: 3600,
		};
		self.invoices.lock().unwrap().insert(bolt11.to_owned(), decoded);
	}

	pub fn push_pay_result(&self, result: Result<PayOutcome, RpcError>) {
		self.pay_results.lock().unwrap().push_back(result);
	}

	pub fn set_sent_payments(&self, hash: PaymentHash, attempts: Vec<SentPaymentStatus>) {
		self.sent_payments.lock().unwrap().insert(hash, attempts);
	}
}

fn now_unix() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl LightningRpc for MockLightningRpc {
	fn node_id(&self) -> PublicKey {
		self.node_key
	}

	fn create_invoice(
		&self, req: CreateInvoice,
	) -> Pin<Box<dyn Future<Output = Result<IssuedInvoice, RpcError>> + Send + '_>> {
		Box::pin(async move {
			let n = self.counter.fetch_add(1, Ordering::SeqCst);
			let bolt11 = format!("lnbcrt1mock{n}");
			let payment_hash = req.preimage.payment_hash();
			let (description, description_hash) = match req.description {
				InvoiceDescription::Direct(d) => (Some(d), None),
				InvoiceDescription::Hash(h) => (None, Some(h)),
			};
			let decoded = DecodedInvoice {
				payment_hash,
				msat: Some(req.msat),
				description,
				description_hash,
				payee: self.node_key,
				route_hints: vec![RouteHint {
					src_node: PublicKey::from_secret_key(&Secp256k1::new(), &req.hint_key),
					short_channel_id: req.hint_scid,
				}],
				created_at: now_unix(),
				expiry_secs: req.expiry_secs,
			};
			self.invoices.lock().unwrap().insert(bolt11.clone(), decoded);
			Ok(IssuedInvoice { bolt11, payment_hash })
		})
	}

	fn decode_invoice(
		&self, bolt11: String,
	) -> Pin<Box<dyn Future<Output = Result<DecodedInvoice, RpcError>> + Send + '_>> {
		Box::pin(async move {
			self.invoices
				.lock()
				.unwrap()
				.get(&bolt11)
				.cloned()
				.ok_or_else(|| RpcError::BadResponse(format!("unknown invoice {bolt11}")))
		})
	}

	fn pay(
		&self, _req: PayRequest,
	) -> Pin<Box<dyn Future<Output = Result<PayOutcome, RpcError>> + Send + '_>> {
		Box::pin(async move {
			self.pay_calls.fetch_add(1, Ordering::SeqCst);
			self.pay_results.lock().unwrap().pop_front().unwrap_or(Ok(PayOutcome::Failed))
		})
	}

	fn list_sent_payments(
		&self, hash: PaymentHash,
	) -> Pin<Box<dyn Future<Output = Result<Vec<SentPaymentStatus>, RpcError>> + Send + '_>> {
		Box::pin(async move {
			Ok(self.sent_payments.lock().unwrap().get(&hash).cloned().unwrap_or_default())
		})
	}
}

/// Collects every event the hub emits, per account.
pub struct RecordingNotifier {
	pub events: Mutex<Vec<(AccountId, PaymentEvent)>>,
}

impl RecordingNotifier {
	pub fn new() -> RecordingNotifier {
		RecordingNotifier { events: Mutex::new(Vec::new()) }
	}

	pub fn events_for(&self, account: AccountId) -> Vec<PaymentEvent> {
		self.events
			.lock()
			.unwrap()
			.iter()
			.filter(|(id, _)| *id == account)
			.map(|(_, e)| e.clone())
			.collect()
	}
}

impl Notifier for RecordingNotifier {
	fn notify(
		&self, account: AccountId, event: PaymentEvent,
	) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
		self.events.lock().unwrap().push((account, event));
		Box::pin(async {})
	}
}

pub struct TestHub {
	pub hub: Hub,
	pub rpc: Arc<MockLightningRpc>,
	pub notifier: Arc<RecordingNotifier>,
}

pub fn build_test_hub() -> TestHub {
	let rpc = Arc::new(MockLightningRpc::new());
	let notifier = Arc::new(RecordingNotifier::new());
	let hub = HubBuilder::new()
		.with_in_memory_ledger()
		.with_key_secret("test-secret".to_owned())
		.with_pay_timeout(Duration::from_secs(5))
		.with_lightning_rpc(Arc::clone(&rpc) as Arc<dyn LightningRpc + Send + Sync>)
		.with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier + Send + Sync>)
		.build()
		.unwrap();
	TestHub { hub, rpc, notifier }
}

/// Waits for an async condition to become true, polling briefly.
pub async fn wait_for_condition<F, Fut>(condition_name: &str, mut condition: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..200 {
		if condition().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("Timeout waiting for condition: {condition_name}");
}

/// Credits an account by issuing an invoice and settling it through the interceptor, the only
/// way money ever enters the hub.
pub async fn fund_account(t: &TestHub, account: AccountId, msat: u64) {
	let before = t.hub.get_balance(account).unwrap();
	let invoice = t
		.hub
		.make_invoice(
			account,
			MakeInvoiceArgs { msat, ignore_rate_limit: true, ..Default::default() },
		)
		.await
		.unwrap();
	let scid = t.rpc.decoded(&invoice.bolt11).route_hints[0].short_channel_id;
	let resolution = t.hub.intercept_htlc(&Htlc {
		amount_msat: msat,
		payment_hash: invoice.payment_hash,
		onion_scid: Some(scid),
	});
	assert!(matches!(resolution, HtlcResolution::Resolve { .. }));
	wait_for_condition("funding credit", || {
		let balance = t.hub.get_balance(account).unwrap();
		async move { balance == before + msat as i64 }
	})
	.await;
}

pub fn make_account(t: &TestHub, origin_id: &str) -> AccountId {
	t.hub.ensure_account(Origin::Telegram, origin_id, Some(origin_id)).unwrap().id
}
