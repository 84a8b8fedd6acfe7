use std::{str::FromStr, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use cucumber::{given, then, when};
use futures_util::future::join_all;
use market_common::Sats;
use market_payment_engine::{
    mpe_api::checkout_objects::{Cart, CartLine, Invoice, SellerCart},
    order_events::{
        EventFilter,
        OrderCreation,
        OrderMessage,
        PaymentReceipt,
        PaymentTag,
        StatusUpdate,
        PAYMENT_RECEIPT_KIND,
    },
    order_types::{InvoiceStatus, OrderItem, OrderStatusType, ShippingStatus},
    split::Share,
    traits::{EventLog, PaymentProof},
    ShippingDetails,
};

use crate::cucumber::{world::MarketSystem, MarketWorld};

//--------------------------------------       Checkout       ---------------------------------------------------------
#[given(expr = "a marketplace where '{word}' is shopping")]
async fn marketplace(world: &mut MarketWorld, buyer: String) {
    world.system = Some(MarketSystem::new(buyer.into()).await);
}

#[given(expr = "a cart '{word}' with order '{word}' from seller '{word}' for {int} sats")]
async fn new_cart(world: &mut MarketWorld, checkout_id: String, order_id: String, seller: String, price: i64) {
    let buyer = world.system().buyer.clone();
    let cart = Cart::new(checkout_id.into(), buyer).with_seller(seller_cart(order_id, seller, price));
    world.cart = Some(cart);
}

#[given(expr = "order '{word}' from seller '{word}' for {int} sats is in the cart")]
async fn add_to_cart(world: &mut MarketWorld, order_id: String, seller: String, price: i64) {
    let cart = world.cart.take().expect("There is no cart");
    world.cart = Some(cart.with_seller(seller_cart(order_id, seller, price)));
}

fn seller_cart(order_id: String, seller: String, price: i64) -> SellerCart {
    SellerCart::new(order_id.into(), seller.into()).with_line(CartLine::new("item", 1, Sats::from(price)))
}

#[given(expr = "seller '{word}' shares {int} percent with '{word}'")]
async fn add_share(world: &mut MarketWorld, seller: String, percent: i64, recipient: String) {
    world.splits.entry(seller.into()).or_default().push(Share::from_percent(recipient, percent as f64));
}

#[when(expr = "the buyer checks out")]
async fn check_out(world: &mut MarketWorld) {
    let cart = world.cart.clone().expect("There is no cart");
    let outcome = world.system().orchestrator.checkout(&cart, &world.splits).await.expect("Checkout failed");
    world.outcome = Some(outcome);
}

#[when(expr = "the buyer pays every invoice with the connected wallet")]
async fn bulk_pay(world: &mut MarketWorld) {
    let sys = world.system();
    let checkout_id = world.outcome().checkout_id.clone();
    let result = sys.reconciler.bulk_pay(&checkout_id, sys.rail.clone()).await;
    world.last_error = result.err().map(|e| e.to_string());
}

#[then(expr = "the checkout has {int} invoices")]
async fn invoice_count(world: &mut MarketWorld, count: usize) {
    assert_eq!(world.outcome().invoices().count(), count, "Unexpected number of invoices");
    assert!(world.outcome().is_complete(), "Some invoice requests failed");
}

#[then(expr = "the invoice for order '{word}' to '{word}' is for {int} sats")]
async fn invoice_amount(world: &mut MarketWorld, order_id: String, recipient: String, amount: i64) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    assert_eq!(invoice.amount, Sats::from(amount), "Invoice amount is incorrect");
}

#[then(expr = "every invoice of the checkout is paid")]
async fn all_paid(world: &mut MarketWorld) {
    assert!(world.last_error.is_none(), "Bulk payment failed: {:?}", world.last_error);
    let checkout_id = world.outcome().checkout_id.clone();
    let snapshot = world.system().ledger.snapshot(&checkout_id).await.expect("Checkout not found");
    for invoice in snapshot.iter().flat_map(|s| s.invoices()) {
        assert_eq!(invoice.status, InvoiceStatus::Paid, "Invoice {} is not paid", invoice.id);
    }
}

#[then(expr = "the checkout is complete")]
async fn checkout_complete(world: &mut MarketWorld) {
    let checkout_id = world.outcome().checkout_id.clone();
    let settled = world.system().ledger.is_checkout_settled(&checkout_id).await.expect("Checkout not found");
    assert!(settled, "Checkout is not complete");
}

#[then(expr = "{int} payment receipts are on the log")]
async fn receipt_count(world: &mut MarketWorld, count: usize) {
    let filter = EventFilter::default().with_kind(PAYMENT_RECEIPT_KIND);
    let receipts = world.system().store.fetch_events(&filter).await.expect("Error fetching receipts");
    assert_eq!(receipts.len(), count, "Unexpected number of receipts");
}

//--------------------------------------    Reconciliation    ---------------------------------------------------------
async fn current_invoice(world: &MarketWorld, order_id: &str, recipient: &str) -> Invoice {
    world
        .system()
        .ledger
        .current_invoice(&order_id.into(), &recipient.into())
        .await
        .unwrap_or_else(|| panic!("No invoice for order {order_id} to {recipient}"))
}

#[when(expr = "the wallet reports the invoice to '{word}' for order '{word}' as paid {int} times")]
async fn repeated_signals(world: &mut MarketWorld, recipient: String, order_id: String, count: usize) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    let preimage = world.system().rail.preimage_for(&invoice.id).expect("No preimage for invoice");
    let mut settled = 0;
    for _ in 0..count {
        let proof = PaymentProof::Preimage(preimage.clone());
        if world.system().reconciler.on_completion_signal(&invoice.id, proof).await.expect("Signal failed") {
            settled += 1;
        }
    }
    world.settled_signals = settled;
}

#[when(expr = "{int} completion signals for the invoice to '{word}' for order '{word}' arrive at once")]
async fn concurrent_signals(world: &mut MarketWorld, count: usize, recipient: String, order_id: String) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    let preimage = world.system().rail.preimage_for(&invoice.id).expect("No preimage for invoice");
    let reconciler = &world.system().reconciler;
    let signals =
        (0..count).map(|_| reconciler.on_completion_signal(&invoice.id, PaymentProof::Preimage(preimage.clone())));
    let results = join_all(signals).await;
    world.settled_signals = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
}

#[when(expr = "the wallet reports the invoice to '{word}' for order '{word}' as paid with a bad preimage")]
async fn bad_signal(world: &mut MarketWorld, recipient: String, order_id: String) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    let proof = PaymentProof::Preimage(hex::encode([7u8; 32]));
    let result = world.system().reconciler.on_completion_signal(&invoice.id, proof).await;
    world.last_error = result.err().map(|e| e.to_string());
}

#[when(expr = "the buyer watches the checkout for receipts")]
async fn watch_checkout(world: &mut MarketWorld) {
    let checkout_id = world.outcome().checkout_id.clone();
    world.system().reconciler.watch_checkout(&checkout_id).await.expect("Could not watch checkout");
}

#[when(expr = "'{word}' publishes a receipt for the invoice to '{word}' for order '{word}'")]
async fn publish_invoice_receipt(world: &mut MarketWorld, author: String, recipient: String, order_id: String) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    let receipt = PaymentReceipt {
        order_id: invoice.order_id.clone(),
        payee: invoice.recipient.clone(),
        invoice_id: invoice.id.clone(),
        payment: PaymentTag::new("lightning", "settled-elsewhere"),
        amount: invoice.amount,
    };
    let event = OrderMessage::PaymentReceipt(receipt).into_event(author.into(), Utc::now());
    world.system().store.publish(event).await.expect("Error publishing receipt");
}

#[when(expr = "I pause for {int}ms")]
async fn pause(_world: &mut MarketWorld, ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[then(expr = "exactly {int} signal settled the invoice")]
async fn settled_once(world: &mut MarketWorld, count: usize) {
    assert_eq!(world.settled_signals, count, "Unexpected number of settling signals");
}

#[then(expr = "the invoice to '{word}' for order '{word}' is {word}")]
async fn invoice_status(world: &mut MarketWorld, recipient: String, order_id: String, status: String) {
    let invoice = current_invoice(world, &order_id, &recipient).await;
    assert_eq!(invoice.status.to_string(), status, "Invoice status is incorrect");
}

#[then(expr = "the invoice to '{word}' for order '{word}' becomes {word}")]
async fn invoice_status_eventually(world: &mut MarketWorld, recipient: String, order_id: String, status: String) {
    for _ in 0..40 {
        if current_invoice(world, &order_id, &recipient).await.status.to_string() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("The invoice to {recipient} for order {order_id} never became {status}");
}

#[then(expr = "the signal is rejected")]
async fn signal_rejected(world: &mut MarketWorld) {
    let error = world.last_error.as_deref().expect("The signal was accepted");
    assert!(error.contains("was rejected"), "Unexpected error: {error}");
}

//--------------------------------------     Order status     ---------------------------------------------------------
#[when(expr = "'{word}' places order '{word}' with seller '{word}' for {int} sats")]
async fn place_order(world: &mut MarketWorld, buyer: String, order_id: String, seller: String, amount: i64) {
    let creation = OrderCreation {
        order_id: order_id.into(),
        seller: seller.into(),
        amount: Sats::from(amount),
        items: vec![OrderItem::new("item", 1)],
        content: String::new(),
    };
    world.system().orders.create_order(buyer.into(), creation).await.expect("Error creating order");
}

#[when(expr = "'{word}' moves order '{word}' to {word}")]
async fn change_status(world: &mut MarketWorld, author: String, order_id: String, status: String) {
    let to = OrderStatusType::from_str(&status).expect("Not a valid order status");
    let result = world.system().orders.request_status_change(&order_id.into(), author.into(), to).await;
    world.last_error = result.err().map(|e| e.to_string());
}

#[when(expr = "'{word}' reports order '{word}' as {word}")]
async fn report_shipping(world: &mut MarketWorld, author: String, order_id: String, status: String) {
    let status = ShippingStatus::from_str(&status).expect("Not a valid shipping status");
    let details = ShippingDetails { carrier: Some("post".into()), ..ShippingDetails::default() };
    let result = world.system().orders.update_shipping(&order_id.into(), author.into(), status, details).await;
    world.last_error = result.err().map(|e| e.to_string());
}

#[when(expr = "'{word}' publishes a receipt for order '{word}'")]
async fn publish_order_receipt(world: &mut MarketWorld, author: String, order_id: String) {
    let order = world.system().orders.order(&order_id.clone().into()).await.expect("Error loading order");
    let order = order.expect("Order does not exist").order;
    let receipt = PaymentReceipt {
        order_id: order.order_id.clone(),
        payee: order.seller.clone(),
        invoice_id: format!("manual-{order_id}").into(),
        payment: PaymentTag::new("onchain", "txid-1"),
        amount: order.total_amount,
    };
    let event = OrderMessage::PaymentReceipt(receipt).into_event(author.into(), Utc::now());
    world.system().store.publish(event).await.expect("Error publishing receipt");
}

// Bypasses the order flow checks, the way a misbehaving client would
#[when(expr = "'{word}' publishes a {word} status for order '{word}' directly to the log")]
async fn publish_raw_status(world: &mut MarketWorld, author: String, status: String, order_id: String) {
    let status = OrderStatusType::from_str(&status).expect("Not a valid order status");
    let state = world.system().orders.order(&order_id.clone().into()).await.expect("Error loading order");
    let order = state.expect("Order does not exist").order;
    let recipient = if author == order.seller.as_str() { order.buyer.clone() } else { order.seller.clone() };
    let update = StatusUpdate { order_id: order.order_id.clone(), recipient, status };
    let created_at = Utc::now().max(order.updated_at + ChronoDuration::seconds(1));
    let event = OrderMessage::StatusUpdate(update).into_event(author.into(), created_at);
    world.system().store.publish(event).await.expect("Error publishing status update");
}

#[then(expr = "order '{word}' has {int} ignored event(s)")]
async fn ignored_events(world: &mut MarketWorld, order_id: String, count: usize) {
    let state = world.system().orders.order(&order_id.clone().into()).await.expect("Error loading order");
    let state = state.unwrap_or_else(|| panic!("Order {order_id} does not exist"));
    assert_eq!(state.ignored.len(), count, "Unexpected ignored events: {:?}", state.ignored);
}

#[then(expr = "order '{word}' is {word}")]
async fn order_status(world: &mut MarketWorld, order_id: String, status: String) {
    let expected = OrderStatusType::from_str(&status).expect("Not a valid order status");
    let state = world.system().orders.order(&order_id.clone().into()).await.expect("Error loading order");
    let state = state.unwrap_or_else(|| panic!("Order {order_id} does not exist"));
    assert_eq!(state.order.status, expected, "Order status is incorrect");
}

#[then(expr = "the change is accepted")]
async fn change_accepted(world: &mut MarketWorld) {
    assert!(world.last_error.is_none(), "The change was rejected: {:?}", world.last_error);
}

#[then(expr = "the change is rejected with {string}")]
async fn change_rejected(world: &mut MarketWorld, message: String) {
    let error = world.last_error.as_deref().expect("The change was accepted");
    assert!(error.contains(&message), "Unexpected error: {error}");
}

#[then(expr = "'{word}' can no longer change order '{word}'")]
async fn no_transitions(world: &mut MarketWorld, author: String, order_id: String) {
    let allowed = world
        .system()
        .orders
        .allowed_transitions(&order_id.into(), &author.clone().into())
        .await
        .expect("Error loading transitions");
    assert!(allowed.is_empty(), "{author} may still move the order to {allowed:?}");
}
