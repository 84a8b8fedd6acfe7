//! Derives the current state of an order from the unordered set of events that reference it, and decides which
//! status changes each party may request next.
//!
//! The log gives no ordering or delivery guarantees, so derivation never replays a transition log in arrival order.
//! Instead, every decision is taken over the deduplicated event *set* using the total order `(created_at, id)`, which
//! makes the result independent of the order in which events were received and of duplicate deliveries.
//!
//! Events that cannot be attributed to the order's buyer or seller, or that describe a step the transition table does
//! not allow at that point, are recorded as ignored noise rather than treated as errors.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::*;
use market_common::Sats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    event::OrderEvent,
    messages::{ChatMessage, OrderMessage, PaymentReceipt, PaymentRequest, ShippingUpdate, StatusUpdate},
};
use crate::order_types::{EventId, OrderId, OrderItem, OrderStatusType, PublicKey, Role, ShippingStatus};

use OrderStatusType::*;

/// Who may move an order from one status to another. Anything not listed is unsupported.
pub const TRANSITIONS: &[(OrderStatusType, OrderStatusType, &[Role])] = &[
    (Pending, Confirmed, &[Role::Seller]),
    (Pending, Cancelled, &[Role::Buyer, Role::Seller]),
    (Confirmed, Processing, &[Role::Seller]),
    (Confirmed, Cancelled, &[Role::Seller]),
    (Processing, Cancelled, &[Role::Seller]),
    (Processing, Completed, &[Role::Buyer]),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("The order is already {0}")]
    SameStatus(OrderStatusType),
    #[error("The order is {0} and can no longer change")]
    Terminal(OrderStatusType),
    #[error("Cannot cancel after confirmation. Contact the seller to cancel this order.")]
    BuyerCannotCancel,
    #[error("A {role} may not move an order from {from} to {to}")]
    RoleNotPermitted { role: Role, from: OrderStatusType, to: OrderStatusType },
    #[error("The order can only be completed once the seller has shipped it")]
    NotYetShipped,
    #[error("An order cannot move from {from} to {to}")]
    Unsupported { from: OrderStatusType, to: OrderStatusType },
    #[error("{0} is neither the buyer nor the seller of this order")]
    NotAParticipant(PublicKey),
}

//--------------------------------------        Order         ---------------------------------------------------------
/// The derived view of an order. Never stored; recomputed from the order's events whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub buyer: PublicKey,
    pub seller: PublicKey,
    pub items: Vec<OrderItem>,
    pub total_amount: Sats,
    pub status: OrderStatusType,
    /// The latest shipping status reported by the seller, if any
    pub shipping_status: Option<ShippingStatus>,
    pub has_been_shipped: bool,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the newest event that contributed to this view
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// The role `author` plays in this order. A key that is both buyer and seller acts as the seller.
    pub fn role_of(&self, author: &PublicKey) -> Option<Role> {
        if author == &self.seller {
            Some(Role::Seller)
        } else if author == &self.buyer {
            Some(Role::Buyer)
        } else {
            None
        }
    }

    pub fn counterparty_of(&self, role: Role) -> &PublicKey {
        match role {
            Role::Buyer => &self.seller,
            Role::Seller => &self.buyer,
        }
    }
}

/// An [`Order`] together with the evidence it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedOrderState {
    pub order: Order,
    /// The last status update that was applied, if any
    pub status_event: Option<EventId>,
    pub latest_shipping: Option<ShippingUpdate>,
    pub payment_requests: Vec<PaymentRequest>,
    pub receipts: Vec<PaymentReceipt>,
    pub messages: Vec<(PublicKey, ChatMessage)>,
    /// Events that reference the order but were disregarded: malformed, tampered, duplicate creations, or authored by
    /// someone not allowed to author them
    pub ignored: Vec<EventId>,
}

/// Derives the state of `order_id` from `events`.
///
/// `events` may contain duplicates, events for other orders, and may be in any order. Returns `None` if there is no
/// creation event for the order, since the order does not exist before it.
///
/// The earliest creation (by timestamp, then event id) defines the order: its author is the buyer and it names the
/// seller. Later creations for the same order id are ignored, whoever wrote them.
///
/// The remaining events are walked in `(created_at, id)` order against a running status that starts at `pending`:
/// * A status update is applied only if [`check_transition`] allows its author to make it from the running status.
///   Anything else is a step the table does not allow, and is ignored.
/// * A payment receipt from the buyer moves a `pending` order to `confirmed`. The seller may still publish its own
///   `confirmed` afterwards.
/// * A `delivered` shipping update from the seller means `completed`. A `shipped` one enables completion by the buyer.
pub fn derive_order(order_id: &OrderId, events: &[OrderEvent]) -> Option<DerivedOrderState> {
    let mut ignored = Vec::new();
    let mut unique = BTreeMap::new();
    for event in events.iter().filter(|e| e.tag_value("order") == Some(order_id.as_str())) {
        unique.insert(event.id.clone(), event);
    }
    let mut parsed = Vec::with_capacity(unique.len());
    for (id, event) in unique {
        if !event.has_valid_id() {
            debug!("📦️ Event {id} on order {order_id} does not match its id. Ignoring it");
            ignored.push(id);
            continue;
        }
        match event.parse() {
            Ok(msg) => parsed.push((event, msg)),
            Err(e) => {
                debug!("📦️ Event {id} on order {order_id} is malformed: {e}. Ignoring it");
                ignored.push(id);
            },
        }
    }
    parsed.sort_by(|(a, _), (b, _)| a.sort_key().cmp(&b.sort_key()));

    let (creation_event, creation) = parsed.iter().find_map(|(ev, msg)| match msg {
        OrderMessage::Creation(c) => Some((*ev, c.clone())),
        _ => None,
    })?;
    let buyer = creation_event.author.clone();
    let seller = creation.seller.clone();
    let mut order = Order {
        order_id: order_id.clone(),
        buyer,
        seller,
        items: creation.items,
        total_amount: creation.amount,
        status: Pending,
        shipping_status: None,
        has_been_shipped: false,
        created_at: creation_event.created_at,
        updated_at: creation_event.created_at,
    };

    let mut status_event = None;
    let mut confirmed_by_receipt = false;
    let mut latest_shipping: Option<ShippingUpdate> = None;
    let mut payment_requests = Vec::new();
    let mut receipts = Vec::new();
    let mut messages = Vec::new();
    for (ev, msg) in parsed.into_iter().filter(|(ev, _)| ev.id != creation_event.id) {
        let is_buyer = ev.author == order.buyer;
        let is_seller = ev.author == order.seller;
        let accepted = match msg {
            OrderMessage::Creation(_) => {
                if ev.author != order.buyer {
                    warn!("📦️ {} published a second creation for order {order_id}. Ignoring it", ev.author);
                }
                false
            },
            OrderMessage::StatusUpdate(update) => match order.role_of(&ev.author) {
                Some(role) => match check_observed(&order, update.status, role, confirmed_by_receipt) {
                    Ok(()) => {
                        order.status = update.status;
                        confirmed_by_receipt = false;
                        status_event = Some(ev.id.clone());
                        true
                    },
                    Err(e) => {
                        trace!("📦️ Status update {} on order {order_id} is out of turn. {e}", ev.id);
                        false
                    },
                },
                None => false,
            },
            OrderMessage::ShippingUpdate(update) if is_seller => {
                order.has_been_shipped |= update.status == ShippingStatus::Shipped;
                if update.status == ShippingStatus::Delivered {
                    order.status = Completed;
                    confirmed_by_receipt = false;
                }
                latest_shipping = Some(update);
                true
            },
            OrderMessage::PaymentReceipt(receipt) if is_buyer => {
                if order.status == Pending {
                    order.status = Confirmed;
                    confirmed_by_receipt = true;
                }
                receipts.push(receipt);
                true
            },
            OrderMessage::PaymentRequest(request) if is_seller => {
                payment_requests.push(request);
                true
            },
            OrderMessage::Message(message) if is_buyer || is_seller => {
                messages.push((ev.author.clone(), message));
                true
            },
            _ => false,
        };
        if accepted {
            order.updated_at = order.updated_at.max(ev.created_at);
        } else {
            trace!("📦️ Event {} by {} is not a valid step for order {order_id}. Ignoring it", ev.id, ev.author);
            ignored.push(ev.id.clone());
        }
    }

    order.shipping_status = latest_shipping.as_ref().map(|s| s.status);
    ignored.sort();
    Some(DerivedOrderState { order, status_event, latest_shipping, payment_requests, receipts, messages, ignored })
}

/// [`check_transition`] for an update seen on the log. A confirmation inferred from a receipt can still be made
/// explicit by the seller.
fn check_observed(
    order: &Order,
    to: OrderStatusType,
    role: Role,
    confirmed_by_receipt: bool,
) -> Result<(), TransitionError> {
    match check_transition(order, to, role) {
        Err(TransitionError::SameStatus(Confirmed)) if confirmed_by_receipt => {
            check_transition(&Order { status: Pending, ..order.clone() }, to, role)
        },
        result => result,
    }
}

/// Checks whether `role` may move `order` to `to`.
pub fn check_transition(order: &Order, to: OrderStatusType, role: Role) -> Result<(), TransitionError> {
    let from = order.status;
    if from == to {
        return Err(TransitionError::SameStatus(from));
    }
    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }
    let (_, _, allowed) = TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .ok_or(TransitionError::Unsupported { from, to })?;
    if !allowed.contains(&role) {
        return match (role, to) {
            (Role::Buyer, Cancelled) => Err(TransitionError::BuyerCannotCancel),
            _ => Err(TransitionError::RoleNotPermitted { role, from, to }),
        };
    }
    if to == Completed && !order.has_been_shipped {
        return Err(TransitionError::NotYetShipped);
    }
    Ok(())
}

/// The statuses `role` may currently move `order` to.
pub fn allowed_transitions(order: &Order, role: Role) -> Vec<OrderStatusType> {
    OrderStatusType::all().into_iter().filter(|to| check_transition(order, *to, role).is_ok()).collect()
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use rand::seq::SliceRandom;

    use super::*;
    use crate::order_events::messages::{OrderCreation, PaymentTag};

    const BUYER: &str = "buyer";
    const SELLER: &str = "seller";

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + ts, 0).unwrap()
    }

    fn oid() -> OrderId {
        OrderId::from("order-1")
    }

    fn creation(ts: i64) -> OrderEvent {
        OrderMessage::Creation(OrderCreation {
            order_id: oid(),
            seller: SELLER.into(),
            amount: Sats::from(100_000),
            items: vec![OrderItem::new("hat", 1)],
            content: String::new(),
        })
        .into_event(BUYER.into(), at(ts))
    }

    fn status(author: &str, status: OrderStatusType, ts: i64) -> OrderEvent {
        let recipient = if author == SELLER { BUYER } else { SELLER };
        OrderMessage::StatusUpdate(StatusUpdate { order_id: oid(), recipient: recipient.into(), status })
            .into_event(author.into(), at(ts))
    }

    fn shipping(status: ShippingStatus, ts: i64) -> OrderEvent {
        OrderMessage::ShippingUpdate(ShippingUpdate {
            order_id: oid(),
            recipient: BUYER.into(),
            status,
            carrier: None,
            tracking: None,
            eta: None,
        })
        .into_event(SELLER.into(), at(ts))
    }

    fn receipt(ts: i64) -> OrderEvent {
        OrderMessage::PaymentReceipt(PaymentReceipt {
            order_id: oid(),
            payee: SELLER.into(),
            invoice_id: "inv-1".into(),
            payment: PaymentTag::new("preimage", "ab"),
            amount: Sats::from(100_000),
        })
        .into_event(BUYER.into(), at(ts))
    }

    fn derive(events: &[OrderEvent]) -> DerivedOrderState {
        derive_order(&oid(), events).unwrap()
    }

    #[test]
    fn no_creation_means_no_order() {
        assert!(derive_order(&oid(), &[status(SELLER, Confirmed, 1)]).is_none());
        assert!(derive_order(&oid(), &[]).is_none());
    }

    #[test]
    fn creation_alone_is_pending() {
        let state = derive(&[creation(0)]);
        assert_eq!(state.order.status, Pending);
        assert_eq!(state.order.buyer, PublicKey::from(BUYER));
        assert_eq!(state.order.seller, PublicKey::from(SELLER));
        assert_eq!(state.order.total_amount, Sats::from(100_000));
        assert!(!state.order.has_been_shipped);
    }

    #[test]
    fn receipt_without_status_update_confirms() {
        let state = derive(&[creation(0), receipt(5)]);
        assert_eq!(state.order.status, Confirmed);
        assert_eq!(state.receipts.len(), 1);
        assert!(state.status_event.is_none());
    }

    #[test]
    fn latest_status_update_wins() {
        let state = derive(&[creation(0), status(SELLER, Confirmed, 1), status(SELLER, Processing, 2), receipt(3)]);
        assert_eq!(state.order.status, Processing);
    }

    #[test]
    fn delivered_overrides_status_updates() {
        let late_cancel = status(SELLER, Cancelled, 4);
        let events = [
            creation(0),
            status(SELLER, Confirmed, 1),
            status(SELLER, Processing, 2),
            shipping(ShippingStatus::Delivered, 3),
            late_cancel.clone(),
        ];
        let state = derive(&events);
        assert_eq!(state.order.status, Completed);
        assert_eq!(state.ignored, vec![late_cancel.id]);
        assert_eq!(state.order.shipping_status, Some(ShippingStatus::Delivered));
        assert!(!state.order.has_been_shipped);
    }

    #[test]
    fn same_timestamp_is_broken_by_event_id() {
        let confirm = status(SELLER, Confirmed, 1);
        let cancel = status(SELLER, Cancelled, 1);
        // Confirming a cancelled order is out of turn, so only one ordering applies both updates
        let expected_ignored = if confirm.id < cancel.id { vec![] } else { vec![confirm.id.clone()] };
        let orderings = [
            [creation(0), confirm.clone(), cancel.clone()],
            [cancel.clone(), confirm.clone(), creation(0)],
        ];
        for events in orderings {
            let state = derive(&events);
            assert_eq!(state.order.status, Cancelled);
            assert_eq!(state.status_event, Some(cancel.id.clone()));
            assert_eq!(state.ignored, expected_ignored);
        }
    }

    #[test]
    fn unauthorised_updates_are_noise() {
        let stranger = status("mallory", Cancelled, 5);
        let buyer_confirms = status(BUYER, Confirmed, 6);
        let buyer_ships = OrderMessage::ShippingUpdate(ShippingUpdate {
            order_id: oid(),
            recipient: SELLER.into(),
            status: ShippingStatus::Delivered,
            carrier: None,
            tracking: None,
            eta: None,
        })
        .into_event(BUYER.into(), at(7));
        let events = [creation(0), stranger.clone(), buyer_confirms.clone(), buyer_ships.clone()];
        let state = derive(&events);
        assert_eq!(state.order.status, Pending);
        assert_eq!(state.ignored.len(), 3);
        for ev in [stranger, buyer_confirms, buyer_ships] {
            assert!(state.ignored.contains(&ev.id));
        }
    }

    #[test]
    fn malformed_and_tampered_events_are_ignored() {
        let mut tampered = status(SELLER, Cancelled, 3);
        tampered.content = "edited".into();
        let mut malformed = status(SELLER, Processing, 4);
        malformed.tags.retain(|t| t[0] != "status");
        malformed.id =
            OrderEvent::compute_id(&malformed.author, &malformed.created_at, malformed.kind, &malformed.tags, "");
        let state = derive(&[creation(0), status(SELLER, Confirmed, 1), tampered, malformed]);
        assert_eq!(state.order.status, Confirmed);
        assert_eq!(state.ignored.len(), 2);
    }

    #[test]
    fn derivation_is_replay_invariant() {
        let events = vec![
            creation(0),
            receipt(1),
            status(SELLER, Confirmed, 2),
            status(SELLER, Processing, 3),
            shipping(ShippingStatus::Processing, 3),
            shipping(ShippingStatus::Shipped, 4),
            status(BUYER, Cancelled, 5),
            status("mallory", Completed, 6),
        ];
        let reference = derive(&events);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut shuffled = events.clone();
            // Replays and duplicates
            shuffled.extend(events.choose_multiple(&mut rng, 3).cloned());
            shuffled.shuffle(&mut rng);
            let state = derive(&shuffled);
            assert_eq!(state.order.status, reference.order.status);
            assert_eq!(state.order.has_been_shipped, reference.order.has_been_shipped);
            assert_eq!(state.order.shipping_status, reference.order.shipping_status);
            assert_eq!(state.ignored, reference.ignored);
        }
        assert_eq!(reference.order.status, Processing);
        assert!(reference.order.has_been_shipped);
        assert_eq!(reference.ignored, {
            let mut ids = vec![events[6].id.clone(), events[7].id.clone()];
            ids.sort();
            ids
        });
    }

    #[test]
    fn out_of_turn_updates_on_the_log_are_noise() {
        let confirm = status(SELLER, Confirmed, 1);
        let late_cancel = status(BUYER, Cancelled, 2);
        let state = derive(&[creation(0), confirm.clone(), late_cancel.clone()]);
        assert_eq!(state.order.status, Confirmed);
        assert_eq!(state.status_event, Some(confirm.id));
        assert_eq!(state.ignored, vec![late_cancel.id]);

        let early_complete = status(BUYER, Completed, 1);
        let state = derive(&[creation(0), early_complete.clone()]);
        assert_eq!(state.order.status, Pending);
        assert!(state.status_event.is_none());
        assert_eq!(state.ignored, vec![early_complete.id]);
    }

    #[test]
    fn completion_counts_only_after_shipment() {
        let too_soon = status(BUYER, Completed, 3);
        let mut events =
            vec![creation(0), status(SELLER, Confirmed, 1), status(SELLER, Processing, 2), too_soon.clone()];
        let state = derive(&events);
        assert_eq!(state.order.status, Processing);
        assert_eq!(state.ignored, vec![too_soon.id.clone()]);

        events.push(shipping(ShippingStatus::Shipped, 4));
        let done = status(BUYER, Completed, 5);
        events.push(done.clone());
        let state = derive(&events);
        assert_eq!(state.order.status, Completed);
        assert_eq!(state.status_event, Some(done.id));
        assert_eq!(state.ignored, vec![too_soon.id]);
    }

    #[test]
    fn seller_may_confirm_after_a_receipt() {
        let confirm = status(SELLER, Confirmed, 2);
        let buyer_cancel = status(BUYER, Cancelled, 3);
        let state = derive(&[creation(0), receipt(1), confirm.clone(), buyer_cancel.clone()]);
        assert_eq!(state.order.status, Confirmed);
        assert_eq!(state.status_event, Some(confirm.id));
        assert_eq!(state.ignored, vec![buyer_cancel.id]);
    }

    #[test]
    fn the_earliest_creation_defines_the_order() {
        let copy = OrderMessage::Creation(OrderCreation {
            order_id: oid(),
            seller: "mallory".into(),
            amount: Sats::from(1),
            items: vec![],
            content: String::new(),
        })
        .into_event("mallory".into(), at(5));
        let state = derive(&[copy.clone(), creation(0), status(SELLER, Confirmed, 6)]);
        assert_eq!(state.order.buyer, PublicKey::from(BUYER));
        assert_eq!(state.order.seller, PublicKey::from(SELLER));
        assert_eq!(state.order.status, Confirmed);
        assert_eq!(state.ignored, vec![copy.id]);
    }

    #[test]
    fn transition_table() {
        let mut order = derive(&[creation(0)]).order;
        assert!(check_transition(&order, Confirmed, Role::Seller).is_ok());
        assert!(check_transition(&order, Cancelled, Role::Buyer).is_ok());
        assert_eq!(
            check_transition(&order, Confirmed, Role::Buyer),
            Err(TransitionError::RoleNotPermitted { role: Role::Buyer, from: Pending, to: Confirmed })
        );
        assert_eq!(check_transition(&order, Pending, Role::Seller), Err(TransitionError::SameStatus(Pending)));

        order.status = Confirmed;
        assert_eq!(check_transition(&order, Cancelled, Role::Buyer), Err(TransitionError::BuyerCannotCancel));
        assert!(check_transition(&order, Cancelled, Role::Seller).is_ok());
        assert_eq!(
            check_transition(&order, Completed, Role::Buyer),
            Err(TransitionError::Unsupported { from: Confirmed, to: Completed })
        );

        order.status = Processing;
        assert_eq!(check_transition(&order, Completed, Role::Buyer), Err(TransitionError::NotYetShipped));
        order.has_been_shipped = true;
        assert!(check_transition(&order, Completed, Role::Buyer).is_ok());
        assert_eq!(allowed_transitions(&order, Role::Buyer), vec![Completed]);
        assert_eq!(allowed_transitions(&order, Role::Seller), vec![Cancelled]);

        order.status = Cancelled;
        assert_eq!(check_transition(&order, Pending, Role::Seller), Err(TransitionError::Terminal(Cancelled)));
        assert!(allowed_transitions(&order, Role::Seller).is_empty());
    }

    #[test]
    fn processing_to_completed_requires_shipment_on_the_log() {
        let events = [creation(0), status(SELLER, Confirmed, 1), status(SELLER, Processing, 2)];
        let order = derive(&events).order;
        assert_eq!(check_transition(&order, Completed, Role::Buyer), Err(TransitionError::NotYetShipped));
        let mut shipped = events.to_vec();
        shipped.push(shipping(ShippingStatus::Shipped, 3));
        let order = derive(&shipped).order;
        assert_eq!(order.status, Processing);
        assert!(check_transition(&order, Completed, Role::Buyer).is_ok());
    }
}
