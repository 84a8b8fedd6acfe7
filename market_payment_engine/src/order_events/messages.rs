//! Typed views of the order message types and their tag encodings.
//!
//! | Message          | kind | `type` | tags                                                                     |
//! |------------------|------|--------|--------------------------------------------------------------------------|
//! | Creation         | 16   | 1      | `p`, `order`, `amount`, `item`+                                          |
//! | PaymentRequest   | 16   | 2      | `p`, `order`, `amount`, `payment` (method, instrument), `payment-request`? |
//! | StatusUpdate     | 16   | 3      | `p`, `order`, `status`                                                   |
//! | ShippingUpdate   | 16   | 4      | `p`, `order`, `status`, `carrier`?, `tracking`?, `eta`?                  |
//! | Message          | 14   |        | `p`, `order`                                                             |
//! | PaymentReceipt   | 17   |        | `p`, `order`, `payment-request`, `payment` (method, proof), `amount`     |
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use market_common::Sats;
use serde::{Deserialize, Serialize};

use super::event::{EventParseError, OrderEvent, OrderEventType};
use crate::order_types::{InvoiceId, OrderId, OrderItem, OrderStatusType, PublicKey, ShippingStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTag {
    /// e.g. `lightning`, `preimage`, `ack`
    pub method: String,
    /// An invoice/instrument for requests, or the proof itself for receipts
    pub reference: String,
}

impl PaymentTag {
    pub fn new<M: Into<String>, R: Into<String>>(method: M, reference: R) -> Self {
        Self { method: method.into(), reference: reference.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreation {
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub amount: Sats,
    pub items: Vec<OrderItem>,
    /// Free-form notes, e.g. the shipping address reference
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub recipient: PublicKey,
    pub amount: Sats,
    pub payment: PaymentTag,
    pub invoice_id: Option<InvoiceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub order_id: OrderId,
    pub recipient: PublicKey,
    pub status: OrderStatusType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingUpdate {
    pub order_id: OrderId,
    pub recipient: PublicKey,
    pub status: ShippingStatus,
    pub carrier: Option<String>,
    pub tracking: Option<String>,
    pub eta: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub order_id: OrderId,
    pub recipient: PublicKey,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub order_id: OrderId,
    pub payee: PublicKey,
    pub invoice_id: InvoiceId,
    pub payment: PaymentTag,
    pub amount: Sats,
}

/// The typed form of an [`OrderEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderMessage {
    Creation(OrderCreation),
    PaymentRequest(PaymentRequest),
    StatusUpdate(StatusUpdate),
    ShippingUpdate(ShippingUpdate),
    Message(ChatMessage),
    PaymentReceipt(PaymentReceipt),
}

impl OrderMessage {
    pub fn event_type(&self) -> OrderEventType {
        match self {
            Self::Creation(_) => OrderEventType::Creation,
            Self::PaymentRequest(_) => OrderEventType::PaymentRequest,
            Self::StatusUpdate(_) => OrderEventType::StatusUpdate,
            Self::ShippingUpdate(_) => OrderEventType::ShippingUpdate,
            Self::Message(_) => OrderEventType::Message,
            Self::PaymentReceipt(_) => OrderEventType::PaymentReceipt,
        }
    }

    pub fn order_id(&self) -> &OrderId {
        match self {
            Self::Creation(m) => &m.order_id,
            Self::PaymentRequest(m) => &m.order_id,
            Self::StatusUpdate(m) => &m.order_id,
            Self::ShippingUpdate(m) => &m.order_id,
            Self::Message(m) => &m.order_id,
            Self::PaymentReceipt(m) => &m.order_id,
        }
    }

    /// The counterparty the message is addressed to.
    pub fn recipient(&self) -> &PublicKey {
        match self {
            Self::Creation(m) => &m.seller,
            Self::PaymentRequest(m) => &m.recipient,
            Self::StatusUpdate(m) => &m.recipient,
            Self::ShippingUpdate(m) => &m.recipient,
            Self::Message(m) => &m.recipient,
            Self::PaymentReceipt(m) => &m.payee,
        }
    }

    /// Encodes the message as an event authored by `author` at `created_at`.
    pub fn into_event(self, author: PublicKey, created_at: DateTime<Utc>) -> OrderEvent {
        let event_type = self.event_type();
        let mut tags = vec![tag("p", self.recipient().as_str())];
        if let Some(t) = event_type.type_tag() {
            tags.push(tag("type", t));
        }
        tags.push(tag("order", self.order_id().as_str()));
        let mut content = String::new();
        match self {
            Self::Creation(m) => {
                tags.push(tag("amount", &m.amount.value().to_string()));
                for item in m.items {
                    tags.push(vec!["item".into(), item.product_ref, item.quantity.to_string()]);
                }
                content = m.content;
            },
            Self::PaymentRequest(m) => {
                tags.push(tag("amount", &m.amount.value().to_string()));
                tags.push(vec!["payment".into(), m.payment.method, m.payment.reference]);
                if let Some(invoice_id) = m.invoice_id {
                    tags.push(tag("payment-request", invoice_id.as_str()));
                }
            },
            Self::StatusUpdate(m) => {
                tags.push(tag("status", &m.status.to_string()));
            },
            Self::ShippingUpdate(m) => {
                tags.push(tag("status", &m.status.to_string()));
                if let Some(carrier) = m.carrier {
                    tags.push(tag("carrier", &carrier));
                }
                if let Some(tracking) = m.tracking {
                    tags.push(tag("tracking", &tracking));
                }
                if let Some(eta) = m.eta {
                    tags.push(tag("eta", &eta.timestamp().to_string()));
                }
            },
            Self::Message(m) => {
                content = m.text;
            },
            Self::PaymentReceipt(m) => {
                tags.push(tag("payment-request", m.invoice_id.as_str()));
                tags.push(vec!["payment".into(), m.payment.method, m.payment.reference]);
                tags.push(tag("amount", &m.amount.value().to_string()));
            },
        }
        OrderEvent::new(author, created_at, event_type.kind(), tags, content)
    }
}

impl TryFrom<&OrderEvent> for OrderMessage {
    type Error = EventParseError;

    fn try_from(ev: &OrderEvent) -> Result<Self, Self::Error> {
        let event_type = ev.event_type()?;
        let order_id = ev.order_id().ok_or(EventParseError::MissingTag("order"))?;
        let recipient = ev.recipient().ok_or(EventParseError::MissingTag("p"))?;
        let msg = match event_type {
            OrderEventType::Creation => {
                let items = ev
                    .tag_values("item")
                    .map(|values| {
                        let product_ref = values.first().ok_or(EventParseError::MissingTag("item"))?;
                        let quantity = match values.get(1) {
                            Some(q) => q.parse::<u32>().map_err(|_| invalid("item", q))?,
                            None => 1,
                        };
                        Ok(OrderItem::new(product_ref.clone(), quantity))
                    })
                    .collect::<Result<Vec<_>, EventParseError>>()?;
                Self::Creation(OrderCreation {
                    order_id,
                    seller: recipient,
                    amount: amount(ev)?,
                    items,
                    content: ev.content.clone(),
                })
            },
            OrderEventType::PaymentRequest => Self::PaymentRequest(PaymentRequest {
                order_id,
                recipient,
                amount: amount(ev)?,
                payment: payment(ev)?,
                invoice_id: ev.tag_value("payment-request").map(InvoiceId::from),
            }),
            OrderEventType::StatusUpdate => {
                let status = required(ev, "status")?;
                let status = OrderStatusType::from_str(status).map_err(|_| invalid("status", status))?;
                Self::StatusUpdate(StatusUpdate { order_id, recipient, status })
            },
            OrderEventType::ShippingUpdate => {
                let status = required(ev, "status")?;
                let status = ShippingStatus::from_str(status).map_err(|_| invalid("status", status))?;
                let eta = match ev.tag_value("eta") {
                    Some(s) => {
                        let ts = s.parse::<i64>().map_err(|_| invalid("eta", s))?;
                        Some(Utc.timestamp_opt(ts, 0).single().ok_or_else(|| invalid("eta", s))?)
                    },
                    None => None,
                };
                Self::ShippingUpdate(ShippingUpdate {
                    order_id,
                    recipient,
                    status,
                    carrier: ev.tag_value("carrier").map(String::from),
                    tracking: ev.tag_value("tracking").map(String::from),
                    eta,
                })
            },
            OrderEventType::Message => Self::Message(ChatMessage { order_id, recipient, text: ev.content.clone() }),
            OrderEventType::PaymentReceipt => Self::PaymentReceipt(PaymentReceipt {
                order_id,
                payee: recipient,
                invoice_id: InvoiceId::from(required(ev, "payment-request")?),
                payment: payment(ev)?,
                amount: amount(ev)?,
            }),
        };
        Ok(msg)
    }
}

fn tag(name: &str, value: &str) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

fn invalid(tag: &'static str, value: &str) -> EventParseError {
    EventParseError::InvalidTag { tag, value: value.to_string() }
}

fn required<'a>(ev: &'a OrderEvent, name: &'static str) -> Result<&'a str, EventParseError> {
    ev.tag_value(name).ok_or(EventParseError::MissingTag(name))
}

fn amount(ev: &OrderEvent) -> Result<Sats, EventParseError> {
    let value = required(ev, "amount")?;
    let sats = value.parse::<Sats>().map_err(|_| invalid("amount", value))?;
    if sats.is_negative() {
        return Err(invalid("amount", value));
    }
    Ok(sats)
}

fn payment(ev: &OrderEvent) -> Result<PaymentTag, EventParseError> {
    let values = ev.tag_values("payment").next().ok_or(EventParseError::MissingTag("payment"))?;
    match values {
        [method, reference, ..] => Ok(PaymentTag::new(method.clone(), reference.clone())),
        [reference] => Ok(PaymentTag::new("unknown", reference.clone())),
        [] => Err(EventParseError::MissingTag("payment")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn creation_encoding() {
        let msg = OrderMessage::Creation(OrderCreation {
            order_id: "o1".into(),
            seller: "seller".into(),
            amount: Sats::from(21_000),
            items: vec![OrderItem::new("30018:seller:hat", 2), OrderItem::new("30018:seller:scarf", 1)],
            content: "ship to locker 4".into(),
        });
        let ev = msg.clone().into_event("buyer".into(), at(1_700_000_000));
        assert_eq!(ev.kind, 16);
        assert_eq!(ev.tag_value("type"), Some("1"));
        assert_eq!(ev.tag_value("amount"), Some("21000"));
        assert_eq!(ev.tag_values("item").count(), 2);
        assert_eq!(ev.parse().unwrap(), msg);
    }

    #[test]
    fn shipping_update_with_optional_tags() {
        let msg = OrderMessage::ShippingUpdate(ShippingUpdate {
            order_id: "o1".into(),
            recipient: "buyer".into(),
            status: ShippingStatus::Shipped,
            carrier: Some("PostNL".into()),
            tracking: None,
            eta: Some(at(1_700_100_000)),
        });
        let ev = msg.clone().into_event("seller".into(), at(1_700_000_000));
        assert_eq!(ev.tag_value("tracking"), None);
        assert_eq!(ev.tag_value("eta"), Some("1700100000"));
        assert_eq!(ev.parse().unwrap(), msg);
    }

    #[test]
    fn receipt_encoding() {
        let msg = OrderMessage::PaymentReceipt(PaymentReceipt {
            order_id: "o1".into(),
            payee: "seller".into(),
            invoice_id: "inv-1".into(),
            payment: PaymentTag::new("preimage", "00ff"),
            amount: Sats::from(90_000),
        });
        let ev = msg.clone().into_event("buyer".into(), at(1_700_000_000));
        assert_eq!(ev.kind, 17);
        assert_eq!(ev.tag_value("type"), None);
        assert_eq!(ev.tag_value("payment-request"), Some("inv-1"));
        assert_eq!(ev.parse().unwrap(), msg);
    }

    #[test]
    fn malformed_events_are_rejected() {
        let base = OrderMessage::StatusUpdate(StatusUpdate {
            order_id: "o1".into(),
            recipient: "seller".into(),
            status: OrderStatusType::Cancelled,
        })
        .into_event("buyer".into(), at(1));

        let mut no_order = base.clone();
        no_order.tags.retain(|t| t[0] != "order");
        assert_eq!(no_order.parse(), Err(EventParseError::MissingTag("order")));

        let mut bad_status = base.clone();
        for t in bad_status.tags.iter_mut().filter(|t| t[0] == "status") {
            t[1] = "teleported".into();
        }
        assert_eq!(bad_status.parse(), Err(EventParseError::InvalidTag { tag: "status", value: "teleported".into() }));

        let mut bad_amount = OrderMessage::PaymentRequest(PaymentRequest {
            order_id: "o1".into(),
            recipient: "r1".into(),
            amount: Sats::from(10),
            payment: PaymentTag::new("lightning", "lnbc10n1..."),
            invoice_id: None,
        })
        .into_event("seller".into(), at(1));
        for t in bad_amount.tags.iter_mut().filter(|t| t[0] == "amount") {
            t[1] = "-10".into();
        }
        assert!(matches!(bad_amount.parse(), Err(EventParseError::InvalidTag { tag: "amount", .. })));
    }
}
