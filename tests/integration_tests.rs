use hub_ledger::notifier::PaymentEvent;
use hub_ledger::{
	Direction, Htlc, HtlcResolution, MakeInvoiceArgs, PayError, PayOutcome, PaymentHash,
	Preimage, ProxyTransfer, RpcError, SentPaymentStatus, PROXY_ACCOUNT,
};

use std::sync::atomic::Ordering;
use std::time::Duration;

mod test_utils;
use test_utils::{build_test_hub, fund_account, make_account, wait_for_condition};

#[tokio::test]
async fn receive_flow_credits_the_invoice_owner() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");

	let invoice = t
		.hub
		.make_invoice(
			alice,
			MakeInvoiceArgs {
				msat: 150_000,
				description: Some("coffee".to_owned()),
				..Default::default()
			},
		)
		.await
		.unwrap();

	let scid = t.rpc.decoded(&invoice.bolt11).route_hints[0].short_channel_id;
	let resolution = t.hub.intercept_htlc(&Htlc {
		amount_msat: 150_000,
		payment_hash: invoice.payment_hash,
		onion_scid: Some(scid),
	});
	match resolution {
		HtlcResolution::Resolve { preimage } => {
			assert_eq!(preimage.payment_hash(), invoice.payment_hash);
		},
		other => panic!("expected Resolve, got {other:?}"),
	}

	wait_for_condition("credit lands", || {
		let balance = t.hub.get_balance(alice).unwrap();
		async move { balance == 150_000 }
	})
	.await;

	let history = t.hub.list_transactions(alice, 10, 0, Direction::Both, None).unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].amount_msat, 150_000);
	assert!(!history[0].pending);
	assert!(history[0].preimage.is_some());

	let events = t.notifier.events_for(alice);
	assert!(matches!(
		events.as_slice(),
		[PaymentEvent::PaymentReceived { msat: 150_000, .. }]
	));
}

#[tokio::test]
async fn small_invoice_rate_limit_applies_per_user() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	let bob = make_account(&t, "bob");

	let args = MakeInvoiceArgs { msat: 900, ..Default::default() };
	t.hub.make_invoice(alice, args.clone()).await.unwrap();
	match t.hub.make_invoice(alice, args.clone()).await {
		Err(hub_ledger::IssueError::RateLimited { tier_msat: 1_000, per_day: 1 }) => {},
		other => panic!("expected RateLimited, got {other:?}"),
	}

	// Other users and exempted flows are unaffected.
	t.hub.make_invoice(bob, args.clone()).await.unwrap();
	t.hub
		.make_invoice(alice, MakeInvoiceArgs { ignore_rate_limit: true, ..args })
		.await
		.unwrap();
}

#[tokio::test]
async fn paying_our_own_invoice_never_hits_the_network() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	let bob = make_account(&t, "bob");
	fund_account(&t, alice, 100_000).await;

	let invoice = t
		.hub
		.make_invoice(
			bob,
			MakeInvoiceArgs { msat: 40_000, ignore_rate_limit: true, ..Default::default() },
		)
		.await
		.unwrap();

	let hash = t.hub.pay_invoice(alice, &invoice.bolt11, 0).await.unwrap();
	assert_eq!(hash, invoice.payment_hash);
	assert_eq!(t.rpc.pay_calls.load(Ordering::SeqCst), 0, "no pay RPC for own invoices");

	assert_eq!(t.hub.get_balance(alice).unwrap(), 60_000);
	assert_eq!(t.hub.get_balance(bob).unwrap(), 40_000);

	// One row, already settled, zero fees.
	let history = t.hub.list_transactions(bob, 10, 0, Direction::Both, None).unwrap();
	assert_eq!(history.len(), 1);
	assert!(!history[0].pending);

	let sent = t.notifier.events_for(alice);
	assert!(matches!(
		sent.last(),
		Some(PaymentEvent::PaymentSent { msat: 40_000, fee_msat: 0, .. })
	));
	let received = t.notifier.events_for(bob);
	assert!(matches!(
		received.last(),
		Some(PaymentEvent::PaymentReceived { msat: 40_000, .. })
	));

	// The shadow record is consumed; the invoice cannot be paid twice.
	match t.hub.pay_invoice(alice, &invoice.bolt11, 0).await {
		Err(PayError::UnknownInternalInvoice) => {},
		other => panic!("expected UnknownInternalInvoice, got {other:?}"),
	}
}

#[tokio::test]
async fn own_invoice_self_payment_is_rejected() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	fund_account(&t, alice, 50_000).await;

	let invoice = t
		.hub
		.make_invoice(
			alice,
			MakeInvoiceArgs { msat: 10_000, ignore_rate_limit: true, ..Default::default() },
		)
		.await
		.unwrap();
	match t.hub.pay_invoice(alice, &invoice.bolt11, 0).await {
		Err(PayError::SelfPayment) => {},
		other => panic!("expected SelfPayment, got {other:?}"),
	}
	assert_eq!(t.hub.get_balance(alice).unwrap(), 50_000);
}

#[tokio::test]
async fn amountless_own_invoice_enforces_bounds() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	let bob = make_account(&t, "bob");
	fund_account(&t, alice, 100_000).await;

	let invoice = t
		.hub
		.make_invoice(
			bob,
			MakeInvoiceArgs { msat: 10_000, ignore_rate_limit: true, ..Default::default() },
		)
		.await
		.unwrap();
	// Strip the amount so the payer has to supply one.
	t.rpc.invoices.lock().unwrap().get_mut(&invoice.bolt11).unwrap().msat = None;

	match t.hub.pay_invoice(alice, &invoice.bolt11, 0).await {
		Err(PayError::InvalidAmount) => {},
		other => panic!("expected InvalidAmount, got {other:?}"),
	}
	match t.hub.pay_invoice(alice, &invoice.bolt11, 5_000).await {
		Err(PayError::AmountBelowInvoice { expected_msat: 10_000 }) => {},
		other => panic!("expected AmountBelowInvoice, got {other:?}"),
	}
	match t.hub.pay_invoice(alice, &invoice.bolt11, 25_000).await {
		Err(PayError::AmountAboveDouble { expected_msat: 10_000 }) => {},
		other => panic!("expected AmountAboveDouble, got {other:?}"),
	}
	assert_eq!(t.hub.get_balance(alice).unwrap(), 100_000);

	// Within bounds settles for the invoiced amount.
	t.hub.pay_invoice(alice, &invoice.bolt11, 15_000).await.unwrap();
	assert_eq!(t.hub.get_balance(alice).unwrap(), 90_000);
	assert_eq!(t.hub.get_balance(bob).unwrap(), 10_000);
}

#[tokio::test]
async fn external_payment_settles_with_actual_fees() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	fund_account(&t, alice, 200_000).await;

	let preimage = Preimage::random();
	let hash = preimage.payment_hash();
	t.rpc.register_external_invoice("lnbcext1", hash, Some(50_000));
	t.rpc.push_pay_result(Ok(PayOutcome::Complete { fees_msat: 150, preimage }));

	let returned = t.hub.pay_invoice(alice, "lnbcext1", 0).await.unwrap();
	assert_eq!(returned, hash);

	wait_for_condition("external payment settles", || {
		let balance = t.hub.get_balance(alice).unwrap();
		async move { balance == 200_000 - 50_000 - 150 }
	})
	.await;
	assert_eq!(t.rpc.pay_calls.load(Ordering::SeqCst), 1);

	let events = t.notifier.events_for(alice);
	assert!(matches!(
		events.last(),
		Some(PaymentEvent::PaymentSent { msat: 50_000, fee_msat: 150, .. })
	));

	// A stale recheck after settlement must not claw anything back, even though the daemon
	// has no attempt on record anymore.
	t.hub.recheck_payment(hash);
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(t.hub.get_balance(alice).unwrap(), 200_000 - 50_000 - 150);
	assert!(!t
		.notifier
		.events_for(alice)
		.iter()
		.any(|e| matches!(e, PaymentEvent::PaymentFailed { .. })));
}

#[tokio::test]
async fn confirmed_failure_refunds_the_reserve() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	fund_account(&t, alice, 200_000).await;

	let hash = Preimage::random().payment_hash();
	t.rpc.register_external_invoice("lnbcext2", hash, Some(50_000));
	t.rpc.push_pay_result(Ok(PayOutcome::Failed));
	t.rpc.set_sent_payments(hash, vec![SentPaymentStatus::Failed]);

	t.hub.pay_invoice(alice, "lnbcext2", 0).await.unwrap();

	wait_for_condition("refund lands", || {
		let balance = t.hub.get_balance(alice).unwrap();
		async move { balance == 200_000 }
	})
	.await;

	// The pending row is gone entirely, not settled.
	let history = t.hub.list_transactions(alice, 10, 0, Direction::Out, None).unwrap();
	assert!(history.iter().all(|e| e.payment_hash != hash));
	assert!(matches!(
		t.notifier.events_for(alice).last(),
		Some(PaymentEvent::PaymentFailed { .. })
	));
}

#[tokio::test]
async fn ambiguous_outcome_stays_pending_until_rechecked() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	fund_account(&t, alice, 200_000).await;

	let preimage = Preimage::random();
	let hash = preimage.payment_hash();
	t.rpc.register_external_invoice("lnbcext3", hash, Some(50_000));
	t.rpc.push_pay_result(Err(RpcError::ConnectionBroken));
	t.rpc.set_sent_payments(hash, vec![SentPaymentStatus::Pending]);

	t.hub.pay_invoice(alice, "lnbcext3", 0).await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	// A broken connection is not a failure: the reserve is still held.
	let reserved = 50_000 + 50_000 / 200 + 5_000;
	assert_eq!(t.hub.get_balance(alice).unwrap(), 200_000 - reserved);

	// Later the daemon reports settlement and a manual recheck picks it up.
	t.rpc
		.set_sent_payments(hash, vec![SentPaymentStatus::Complete { fees_msat: 90, preimage }]);
	t.hub.recheck_payment(hash);
	wait_for_condition("recheck settles", || {
		let balance = t.hub.get_balance(alice).unwrap();
		async move { balance == 200_000 - 50_000 - 90 }
	})
	.await;
}

#[tokio::test]
async fn overdraft_refuses_before_any_rpc() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	fund_account(&t, alice, 10_000).await;

	let hash = Preimage::random().payment_hash();
	t.rpc.register_external_invoice("lnbcext4", hash, Some(9_990));

	match t.hub.pay_invoice(alice, "lnbcext4", 0).await {
		// 9_990 plus the 5_049 msat fee reserve against a 10_000 balance.
		Err(PayError::InsufficientBalance { missing_msat }) => assert_eq!(missing_msat, 5_039),
		other => panic!("expected InsufficientBalance, got {other:?}"),
	}
	assert_eq!(t.hub.get_balance(alice).unwrap(), 10_000);
	assert_eq!(t.rpc.pay_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn internal_send_moves_exactly_what_was_asked() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	let bob = make_account(&t, "bob");
	fund_account(&t, alice, 5_000).await;

	t.hub.send_internally(alice, bob, 2_000, Some("tip"), None, None).await.unwrap();
	assert_eq!(t.hub.get_balance(alice).unwrap(), 3_000);
	assert_eq!(t.hub.get_balance(bob).unwrap(), 2_000);
	assert!(matches!(
		t.notifier.events_for(bob).last(),
		Some(PaymentEvent::PaymentReceived { msat: 2_000, .. })
	));

	match t.hub.send_internally(alice, alice, 1_000, None, None, None).await {
		Err(PayError::SelfPayment) => {},
		other => panic!("expected SelfPayment, got {other:?}"),
	}
	match t.hub.send_internally(alice, bob, 0, None, None, None).await {
		Err(PayError::InvalidAmount) => {},
		other => panic!("expected InvalidAmount, got {other:?}"),
	}
	match t.hub.send_internally(alice, bob, 10_000, None, None, None).await {
		Err(PayError::InsufficientBalance { .. }) => {},
		other => panic!("expected InsufficientBalance, got {other:?}"),
	}
	assert_eq!(t.hub.get_balance(alice).unwrap(), 3_000);
}

#[tokio::test]
async fn proxied_sends_clear_through_a_zero_sum_account() {
	let t = build_test_hub();
	let alice = make_account(&t, "alice");
	let bob = make_account(&t, "bob");
	fund_account(&t, alice, 10_000).await;

	let transfer = ProxyTransfer {
		payer: alice,
		payee: bob,
		amount_msat: 1_500,
		source_hash: PaymentHash::random(),
		target_hash: PaymentHash::random(),
		source_description: Some("ticket".to_owned()),
		target_description: Some("ticket from alice".to_owned()),
		tag: Some("ticket".to_owned()),
		pending: false,
		source_trigger: None,
		target_trigger: None,
	};
	t.hub.send_through_proxy(transfer.clone()).await.unwrap();
	t.hub.send_through_proxy(transfer).await.unwrap();

	assert_eq!(t.hub.get_balance(alice).unwrap(), 7_000);
	assert_eq!(t.hub.get_balance(bob).unwrap(), 3_000);
	assert_eq!(t.hub.get_balance(PROXY_ACCOUNT).unwrap(), 0);
	assert_eq!(t.hub.tagged_balances(bob).unwrap(), vec![("ticket".to_owned(), 3_000)]);
}
