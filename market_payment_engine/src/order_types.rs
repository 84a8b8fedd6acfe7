use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl<S: Into<String>> From<S> for $name {
            fn from(value: S) -> Self {
                Self(value.into())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

//--------------------------------------     Identifiers     ---------------------------------------------------------
string_id!(
    /// The correlation key chosen once at order creation and carried on every subsequent order message.
    OrderId
);
string_id!(
    /// A lightweight wrapper around a hex-encoded public key identifying a buyer, seller or share recipient.
    PublicKey
);
string_id!(InvoiceId);
string_id!(
    /// The content-derived id of an event on the log.
    EventId
);
string_id!(
    /// Groups the invoice sets of every seller in a single cart checkout.
    CheckoutId
);

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(pub String);

//--------------------------------------        Role          ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Buyer => write!(f, "buyer"),
            Role::Seller => write!(f, "seller"),
        }
    }
}

//--------------------------------------   OrderStatusType    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatusType {
    /// The order has been created but the seller has not acknowledged it yet.
    Pending,
    /// The seller accepted the order, or a payment receipt was observed.
    Confirmed,
    /// The seller is preparing the order.
    Processing,
    /// The buyer confirmed receipt, or the shipment was delivered.
    Completed,
    /// The order was cancelled. Terminal.
    Cancelled,
}

impl OrderStatusType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn all() -> [OrderStatusType; 5] {
        [Self::Pending, Self::Confirmed, Self::Processing, Self::Completed, Self::Cancelled]
    }
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatusType::Pending => write!(f, "pending"),
            OrderStatusType::Confirmed => write!(f, "confirmed"),
            OrderStatusType::Processing => write!(f, "processing"),
            OrderStatusType::Completed => write!(f, "completed"),
            OrderStatusType::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for OrderStatusType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            s => Err(ConversionError(format!("Invalid order status: {s}"))),
        }
    }
}

//--------------------------------------   ShippingStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingStatus {
    Processing,
    Shipped,
    Delivered,
    Exception,
}

impl Display for ShippingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShippingStatus::Processing => write!(f, "processing"),
            ShippingStatus::Shipped => write!(f, "shipped"),
            ShippingStatus::Delivered => write!(f, "delivered"),
            ShippingStatus::Exception => write!(f, "exception"),
        }
    }
}

impl FromStr for ShippingStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" => Ok(Self::Processing),
            "shipped" => Ok(Self::Shipped),
            "delivered" => Ok(Self::Delivered),
            "exception" => Ok(Self::Exception),
            s => Err(ConversionError(format!("Invalid shipping status: {s}"))),
        }
    }
}

//--------------------------------------    InvoiceStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Created by the orchestrator, not yet being paid.
    Pending,
    /// A payment attempt has started.
    Processing,
    /// The first accepted completion signal arrived. Set exactly once.
    Paid,
    /// The rail reported an error. Retry by requesting a fresh invoice.
    Failed,
    /// The invoice passed its expiry without being paid.
    Expired,
    /// Settlement was deferred. Only allowed outside a live checkout run.
    Skipped,
}

impl InvoiceStatus {
    /// Whether a payment attempt may still be made against this invoice.
    pub fn is_payable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Paid or deliberately deferred.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Skipped)
    }
}

impl Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvoiceStatus::Pending => write!(f, "pending"),
            InvoiceStatus::Processing => write!(f, "processing"),
            InvoiceStatus::Paid => write!(f, "paid"),
            InvoiceStatus::Failed => write!(f, "failed"),
            InvoiceStatus::Expired => write!(f, "expired"),
            InvoiceStatus::Skipped => write!(f, "skipped"),
        }
    }
}

//--------------------------------------    RecipientKind     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecipientKind {
    Merchant,
    ShareRecipient,
}

impl Display for RecipientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientKind::Merchant => write!(f, "merchant"),
            RecipientKind::ShareRecipient => write!(f, "share recipient"),
        }
    }
}

//--------------------------------------      OrderItem       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Reference to the product listing, as understood by the catalog
    pub product_ref: String,
    pub quantity: u32,
}

impl OrderItem {
    pub fn new<S: Into<String>>(product_ref: S, quantity: u32) -> Self {
        Self { product_ref: product_ref.into(), quantity }
    }
}
