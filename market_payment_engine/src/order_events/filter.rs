use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{OrderEvent, OrderEventType};
use crate::order_types::{OrderId, PublicKey};

/// Selects events from an event log. Every field that is set must match; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub order_id: Option<OrderId>,
    pub kinds: Option<Vec<u16>>,
    pub event_types: Option<Vec<OrderEventType>>,
    pub authors: Option<Vec<PublicKey>>,
    /// Matches the `p` tag
    pub recipient: Option<PublicKey>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_order(order_id: OrderId) -> Self {
        Self::default().with_order_id(order_id)
    }

    pub fn with_order_id(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn with_kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn with_event_type(mut self, event_type: OrderEventType) -> Self {
        self.event_types.get_or_insert_with(Vec::new).push(event_type);
        self
    }

    pub fn with_author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author);
        self
    }

    pub fn with_recipient(mut self, recipient: PublicKey) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.order_id.is_none() &&
            self.kinds.is_none() &&
            self.event_types.is_none() &&
            self.authors.is_none() &&
            self.recipient.is_none() &&
            self.since.is_none() &&
            self.until.is_none()
    }

    pub fn matches(&self, event: &OrderEvent) -> bool {
        if let Some(order_id) = &self.order_id {
            if event.tag_value("order") != Some(order_id.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !event.event_type().is_ok_and(|t| types.contains(&t)) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.author) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if event.tag_value("p") != Some(recipient.as_str()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

impl Display for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "No filters.")?;
            return Ok(());
        }
        if let Some(order_id) = &self.order_id {
            write!(f, "order_id: {order_id}. ")?;
        }
        if let Some(kinds) = &self.kinds {
            let kinds = kinds.iter().map(|k| k.to_string()).collect::<Vec<String>>().join(",");
            write!(f, "kinds: [{kinds}]. ")?;
        }
        if let Some(types) = &self.event_types {
            let types = types.iter().map(|t| t.to_string()).collect::<Vec<String>>().join(",");
            write!(f, "types: [{types}]. ")?;
        }
        if let Some(authors) = &self.authors {
            let authors = authors.iter().map(|a| a.to_string()).collect::<Vec<String>>().join(",");
            write!(f, "authors: [{authors}]. ")?;
        }
        if let Some(recipient) = &self.recipient {
            write!(f, "recipient: {recipient}. ")?;
        }
        if let Some(since) = &self.since {
            write!(f, "since {since}. ")?;
        }
        if let Some(until) = &self.until {
            write!(f, "until {until}. ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;
    use crate::order_events::{MESSAGE_KIND, PAYMENT_RECEIPT_KIND};

    fn message(order: &str, author: &str, ts: i64) -> OrderEvent {
        let tags = vec![vec!["p".to_string(), "seller".to_string()], vec!["order".to_string(), order.to_string()]];
        OrderEvent::new(author.into(), Utc.timestamp_opt(ts, 0).unwrap(), MESSAGE_KIND, tags, "hello".into())
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&message("o1", "buyer", 100)));
        assert_eq!(filter.to_string(), "No filters.");
    }

    #[test]
    fn all_criteria_must_match() {
        let filter = EventFilter::for_order("o1".into())
            .with_kind(MESSAGE_KIND)
            .with_author("buyer".into())
            .since(Utc.timestamp_opt(50, 0).unwrap());
        assert!(filter.matches(&message("o1", "buyer", 100)));
        assert!(!filter.matches(&message("o2", "buyer", 100)));
        assert!(!filter.matches(&message("o1", "mallory", 100)));
        assert!(!filter.matches(&message("o1", "buyer", 10)));
        assert!(!filter.clone().with_recipient("someone".into()).matches(&message("o1", "buyer", 100)));

        let receipts_only = EventFilter::for_order("o1".into()).with_kind(PAYMENT_RECEIPT_KIND);
        assert!(!receipts_only.matches(&message("o1", "buyer", 100)));
        assert_eq!(receipts_only.to_string(), "order_id: o1. kinds: [17]. ");
    }
}
