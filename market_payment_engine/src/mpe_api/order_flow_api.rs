use chrono::{DateTime, Duration, Utc};
use log::*;
use market_common::Sats;

use super::errors::OrderFlowError;
use crate::{
    events::{EventProducers, OrderStatusChangedEvent},
    order_events::{
        allowed_transitions,
        check_transition,
        derive_order,
        ChatMessage,
        DerivedOrderState,
        EventFilter,
        OrderCreation,
        OrderEvent,
        OrderMessage,
        PaymentRequest,
        PaymentTag,
        ShippingUpdate,
        StatusUpdate,
        TransitionError,
    },
    order_types::{InvoiceId, OrderId, OrderStatusType, PublicKey, Role, ShippingStatus},
    traits::EventLog,
};

/// Optional details that accompany a shipping status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShippingDetails {
    pub carrier: Option<String>,
    pub tracking: Option<String>,
    pub eta: Option<DateTime<Utc>>,
}

/// `OrderFlowApi` emits order messages on behalf of a buyer or seller, refusing any message the order's current
/// state does not allow, and reads back the derived state of an order.
pub struct OrderFlowApi<L> {
    log: L,
    producers: EventProducers,
}

impl<L> OrderFlowApi<L>
where L: EventLog
{
    pub fn new(log: L, producers: EventProducers) -> Self {
        Self { log, producers }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Publishes the creation event for a new order, authored by `buyer`.
    pub async fn create_order(
        &self,
        buyer: PublicKey,
        creation: OrderCreation,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        if !creation.amount.is_positive() {
            return Err(OrderFlowError::InvalidAmount);
        }
        let order_id = creation.order_id.clone();
        let mut events = self.order_history(&order_id).await?;
        if derive_order(&order_id, &events).is_some() {
            return Err(OrderFlowError::OrderAlreadyExists(order_id));
        }
        let event = OrderMessage::Creation(creation).into_event(buyer, Utc::now());
        self.log.publish(event.clone()).await?;
        info!("📦️ Order {order_id} created by {}", event.author);
        events.push(event);
        derive_order(&order_id, &events).ok_or(OrderFlowError::OrderNotFound(order_id))
    }

    /// The derived state of the order, or `None` if its creation event has not been seen.
    pub async fn order(&self, order_id: &OrderId) -> Result<Option<DerivedOrderState>, OrderFlowError> {
        let events = self.order_history(order_id).await?;
        Ok(derive_order(order_id, &events))
    }

    /// Every event on the log for the order, oldest first.
    pub async fn order_history(&self, order_id: &OrderId) -> Result<Vec<OrderEvent>, OrderFlowError> {
        let mut events = self.log.fetch_events(&EventFilter::for_order(order_id.clone())).await?;
        events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(events)
    }

    /// The statuses `author` may currently move the order to.
    pub async fn allowed_transitions(
        &self,
        order_id: &OrderId,
        author: &PublicKey,
    ) -> Result<Vec<OrderStatusType>, OrderFlowError> {
        let (_, state) = self.load(order_id).await?;
        let role = role_of(&state, author)?;
        Ok(allowed_transitions(&state.order, role))
    }

    /// Publishes a status update after checking that `author` may make it.
    pub async fn request_status_change(
        &self,
        order_id: &OrderId,
        author: PublicKey,
        to: OrderStatusType,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        let (events, state) = self.load(order_id).await?;
        let role = role_of(&state, &author)?;
        if let Err(e) = check_transition(&state.order, to, role) {
            info!("📦️ {author} may not move order {order_id} to {to}. {e}");
            return Err(e.into());
        }
        let update = OrderMessage::StatusUpdate(StatusUpdate {
            order_id: order_id.clone(),
            recipient: state.order.counterparty_of(role).clone(),
            status: to,
        });
        self.emit(events, &state, author, update).await
    }

    /// Publishes a shipping update. Only the seller ships.
    pub async fn update_shipping(
        &self,
        order_id: &OrderId,
        author: PublicKey,
        status: ShippingStatus,
        details: ShippingDetails,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        let (events, state) = self.load(order_id).await?;
        if role_of(&state, &author)? != Role::Seller {
            return Err(OrderFlowError::NotSeller(author, "update shipping"));
        }
        if state.order.status == OrderStatusType::Cancelled {
            return Err(TransitionError::Terminal(OrderStatusType::Cancelled).into());
        }
        let update = OrderMessage::ShippingUpdate(ShippingUpdate {
            order_id: order_id.clone(),
            recipient: state.order.buyer.clone(),
            status,
            carrier: details.carrier,
            tracking: details.tracking,
            eta: details.eta,
        });
        self.emit(events, &state, author, update).await
    }

    /// Publishes payment instructions for the buyer. Only the seller requests payment.
    pub async fn send_payment_request(
        &self,
        order_id: &OrderId,
        author: PublicKey,
        amount: Sats,
        payment: PaymentTag,
        invoice_id: Option<InvoiceId>,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        if !amount.is_positive() {
            return Err(OrderFlowError::InvalidAmount);
        }
        let (events, state) = self.load(order_id).await?;
        if role_of(&state, &author)? != Role::Seller {
            return Err(OrderFlowError::NotSeller(author, "request payment"));
        }
        let request = OrderMessage::PaymentRequest(PaymentRequest {
            order_id: order_id.clone(),
            recipient: state.order.buyer.clone(),
            amount,
            payment,
            invoice_id,
        });
        self.emit(events, &state, author, request).await
    }

    /// Sends a free-text message to the other party.
    pub async fn send_message(
        &self,
        order_id: &OrderId,
        author: PublicKey,
        text: String,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        let (events, state) = self.load(order_id).await?;
        let role = role_of(&state, &author)?;
        let message = OrderMessage::Message(ChatMessage {
            order_id: order_id.clone(),
            recipient: state.order.counterparty_of(role).clone(),
            text,
        });
        self.emit(events, &state, author, message).await
    }

    async fn load(&self, order_id: &OrderId) -> Result<(Vec<OrderEvent>, DerivedOrderState), OrderFlowError> {
        let events = self.order_history(order_id).await?;
        let state = derive_order(order_id, &events).ok_or_else(|| OrderFlowError::OrderNotFound(order_id.clone()))?;
        Ok((events, state))
    }

    async fn emit(
        &self,
        mut events: Vec<OrderEvent>,
        before: &DerivedOrderState,
        author: PublicKey,
        message: OrderMessage,
    ) -> Result<DerivedOrderState, OrderFlowError> {
        let order_id = before.order.order_id.clone();
        let event = message.into_event(author.clone(), next_timestamp(before));
        self.log.publish(event.clone()).await?;
        debug!("📦️ Published {event}");
        let event_id = event.id.clone();
        events.push(event);
        let after = derive_order(&order_id, &events).ok_or_else(|| OrderFlowError::OrderNotFound(order_id.clone()))?;
        if after.order.status != before.order.status {
            info!("📦️ Order {order_id} is now {} (was {})", after.order.status, before.order.status);
            let changed = OrderStatusChangedEvent {
                order_id,
                old_status: before.order.status,
                new_status: after.order.status,
                author,
                event_id,
            };
            self.producers.publish_order_status_changed(changed).await;
        }
        Ok(after)
    }
}

fn role_of(state: &DerivedOrderState, author: &PublicKey) -> Result<Role, OrderFlowError> {
    state.order.role_of(author).ok_or_else(|| TransitionError::NotAParticipant(author.clone()).into())
}

// Timestamps have one-second resolution. A new message must sort after everything it was based on.
fn next_timestamp(state: &DerivedOrderState) -> DateTime<Utc> {
    Utc::now().max(state.order.updated_at + Duration::seconds(1))
}
