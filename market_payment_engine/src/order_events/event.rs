use std::fmt::Display;

use blake2::{digest::consts::U32, Blake2b, Digest};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    order_events::messages::OrderMessage,
    order_types::{EventId, OrderId, PublicKey},
};

type Blake2b256 = Blake2b<U32>;

/// Order creation, payment requests, status updates and shipping updates. Distinguished by the `type` tag.
pub const ORDER_PROCESSING_KIND: u16 = 16;
/// Free-text buyer/seller conversation about an order.
pub const MESSAGE_KIND: u16 = 14;
/// Proof that an invoice was paid.
pub const PAYMENT_RECEIPT_KIND: u16 = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventParseError {
    #[error("Event kind {0} is not an order event")]
    UnknownKind(u16),
    #[error("Unknown order message type: {0}")]
    UnknownType(String),
    #[error("Required tag '{0}' is missing")]
    MissingTag(&'static str),
    #[error("Tag '{tag}' has an invalid value: {value}")]
    InvalidTag { tag: &'static str, value: String },
}

//--------------------------------------   OrderEventType     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderEventType {
    Creation,
    PaymentRequest,
    StatusUpdate,
    ShippingUpdate,
    Message,
    PaymentReceipt,
}

impl OrderEventType {
    pub fn kind(&self) -> u16 {
        match self {
            Self::Creation | Self::PaymentRequest | Self::StatusUpdate | Self::ShippingUpdate => ORDER_PROCESSING_KIND,
            Self::Message => MESSAGE_KIND,
            Self::PaymentReceipt => PAYMENT_RECEIPT_KIND,
        }
    }

    /// The value of the `type` tag for order processing events.
    pub fn type_tag(&self) -> Option<&'static str> {
        match self {
            Self::Creation => Some("1"),
            Self::PaymentRequest => Some("2"),
            Self::StatusUpdate => Some("3"),
            Self::ShippingUpdate => Some("4"),
            Self::Message | Self::PaymentReceipt => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::PaymentRequest => "payment-request",
            Self::StatusUpdate => "status-update",
            Self::ShippingUpdate => "shipping-update",
            Self::Message => "message",
            Self::PaymentReceipt => "payment-receipt",
        }
    }

    pub fn from_kind_and_type(kind: u16, type_tag: Option<&str>) -> Result<Self, EventParseError> {
        match (kind, type_tag) {
            (MESSAGE_KIND, _) => Ok(Self::Message),
            (PAYMENT_RECEIPT_KIND, _) => Ok(Self::PaymentReceipt),
            (ORDER_PROCESSING_KIND, Some("1")) => Ok(Self::Creation),
            (ORDER_PROCESSING_KIND, Some("2")) => Ok(Self::PaymentRequest),
            (ORDER_PROCESSING_KIND, Some("3")) => Ok(Self::StatusUpdate),
            (ORDER_PROCESSING_KIND, Some("4")) => Ok(Self::ShippingUpdate),
            (ORDER_PROCESSING_KIND, Some(t)) => Err(EventParseError::UnknownType(t.to_string())),
            (ORDER_PROCESSING_KIND, None) => Err(EventParseError::MissingTag("type")),
            (k, _) => Err(EventParseError::UnknownKind(k)),
        }
    }
}

impl Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------      OrderEvent      ---------------------------------------------------------
/// One immutable, order-correlated message on the log.
///
/// The id is a Blake2b-256 digest of the canonical serialisation `[0, author, created_at, kind, tags, content]`, so
/// the same message delivered twice is recognised as a duplicate no matter which relay or cache it came from.
/// Signing is the transport's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: EventId,
    pub author: PublicKey,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl OrderEvent {
    pub fn new(
        author: PublicKey,
        created_at: DateTime<Utc>,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let created_at = created_at.trunc_subsecs(0);
        let id = Self::compute_id(&author, &created_at, kind, &tags, &content);
        Self { id, author, created_at, kind, tags, content }
    }

    pub fn compute_id(
        author: &PublicKey,
        created_at: &DateTime<Utc>,
        kind: u16,
        tags: &[Vec<String>],
        content: &str,
    ) -> EventId {
        let canonical = serde_json::json!([0, author.as_str(), created_at.timestamp(), kind, tags, content]);
        let digest = Blake2b256::digest(canonical.to_string().as_bytes());
        EventId(hex::encode(digest))
    }

    /// False if the event's content was altered after its id was computed.
    pub fn has_valid_id(&self) -> bool {
        Self::compute_id(&self.author, &self.created_at, self.kind, &self.tags, &self.content) == self.id
    }

    /// The first value of the first tag called `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All tags called `name`, without the name itself.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.tags.iter().filter(move |t| t.first().map(String::as_str) == Some(name)).map(|t| &t[1..])
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.tag_value("order").map(OrderId::from)
    }

    /// The `p` tag: the counterparty this event is addressed to.
    pub fn recipient(&self) -> Option<PublicKey> {
        self.tag_value("p").map(PublicKey::from)
    }

    pub fn event_type(&self) -> Result<OrderEventType, EventParseError> {
        OrderEventType::from_kind_and_type(self.kind, self.tag_value("type"))
    }

    pub fn parse(&self) -> Result<OrderMessage, EventParseError> {
        OrderMessage::try_from(self)
    }

    /// Total ordering used to pick the "latest" of several events: timestamp first, then event id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

impl Display for OrderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = self.event_type().map(|t| t.to_string()).unwrap_or_else(|_| format!("kind {}", self.kind));
        let short_id = &self.id.as_str()[..self.id.as_str().len().min(12)];
        write!(f, "[{short_id}] {kind} by {} at {}", self.author, self.created_at)
    }
}
