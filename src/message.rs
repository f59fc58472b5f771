use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::rabbitmq::errors::PayloadError;

/// Header carrying the application-level redelivery counter.
pub const RETRY_COUNT_HEADER: &str = "retry-count";
const LEGACY_RETRY_COUNT_HEADER: &str = "x-retry-count";

pub const MAX_PRIORITY: u8 = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Transient = 1,
    Persistent = 2,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Scalar header value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{}", v),
            HeaderValue::Int(v) => write!(f, "{}", v),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(value as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

/// A message body plus its properties. Immutable once built; use [`EnvelopeBuilder`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    body: Vec<u8>,
    headers: BTreeMap<String, HeaderValue>,
    delivery_mode: DeliveryMode,
    priority: Option<u8>,
    content_type: Option<String>,
}

impl Envelope {
    /// Transient envelope without headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Envelope {
            body: body.into(),
            ..Envelope::default()
        }
    }

    pub fn builder(body: impl Into<Vec<u8>>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            envelope: Envelope::new(body),
        }
    }

    /// Serialize `value` as the body with an `application/json` content type.
    pub fn json<T: Serialize>(value: &T) -> Result<EnvelopeBuilder, PayloadError> {
        let body = serde_json::to_vec(value).map_err(|e| PayloadError::Encode(e.to_string()))?;
        Ok(Envelope::builder(body).content_type("application/json"))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, HeaderValue> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Copy of this envelope with a different retry-count header, for republishing.
    pub fn with_retry_count(&self, count: u32) -> Envelope {
        let mut next = self.clone();
        next.headers.remove(LEGACY_RETRY_COUNT_HEADER);
        next.headers
            .insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::from(count));
        next
    }
}

#[derive(Debug)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    /// Insert a header; a later value for the same key replaces the earlier one.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.envelope.headers.insert(key.into(), value.into());
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.envelope.delivery_mode = mode;
        self
    }

    pub fn persistent(self) -> Self {
        self.delivery_mode(DeliveryMode::Persistent)
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.envelope.priority = Some(priority);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.envelope.content_type = Some(content_type.into());
        self
    }

    pub fn build(self) -> Result<Envelope, PayloadError> {
        match self.envelope.priority {
            Some(p) if p > MAX_PRIORITY => Err(PayloadError::InvalidPriority(p)),
            _ => Ok(self.envelope),
        }
    }
}

/// Flags that travel with a publish rather than with the message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishFlags {
    /// Return the message to the publisher when no queue is bound for it.
    pub mandatory: bool,
}

impl PublishFlags {
    pub fn mandatory() -> Self {
        PublishFlags { mandatory: true }
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub message: Envelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        self.message.body()
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.message.body())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(self.message.body()).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    /// How many times the application has already retried this message. This is a header
    /// convention maintained by publishers, not a broker guarantee.
    pub fn retry_count(&self) -> u32 {
        self.message
            .header(RETRY_COUNT_HEADER)
            .or_else(|| self.message.header(LEGACY_RETRY_COUNT_HEADER))
            .and_then(HeaderValue::as_i64)
            .map(|n| n.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        total: f64,
    }

    fn delivery(message: Envelope) -> Delivery {
        Delivery {
            message,
            delivery_tag: 1,
            redelivered: false,
            exchange: "orders".to_string(),
            routing_key: "order.created".to_string(),
        }
    }

    #[test]
    fn test_builder_rejects_priority_above_nine() {
        let result = Envelope::builder("x").priority(10).build();
        assert_eq!(result, Err(PayloadError::InvalidPriority(10)));

        let envelope = Envelope::builder("x").priority(9).persistent().build().unwrap();
        assert_eq!(envelope.priority(), Some(9));
        assert_eq!(envelope.delivery_mode(), DeliveryMode::Persistent);
    }

    #[test]
    fn test_header_keys_are_unique() {
        let envelope = Envelope::builder("x")
            .header("source", "a")
            .header("source", "b")
            .build()
            .unwrap();

        assert_eq!(envelope.headers().len(), 1);
        assert_eq!(envelope.header("source"), Some(&HeaderValue::from("b")));
    }

    #[test]
    fn test_retry_count_reads_both_header_spellings() {
        assert_eq!(delivery(Envelope::new("x")).retry_count(), 0);

        let current = Envelope::builder("x").header("retry-count", 3i64).build().unwrap();
        assert_eq!(delivery(current).retry_count(), 3);

        let legacy = Envelope::builder("x").header("x-retry-count", "2").build().unwrap();
        assert_eq!(delivery(legacy.clone()).retry_count(), 2);

        let bumped = legacy.with_retry_count(5);
        assert_eq!(bumped.header("x-retry-count"), None);
        assert_eq!(delivery(bumped).retry_count(), 5);
    }

    #[test]
    fn test_json_body_and_malformed_payload() {
        let order = OrderCreated {
            order_id: "o-1".to_string(),
            total: 59.99,
        };
        let envelope = Envelope::json(&order).unwrap().build().unwrap();
        assert_eq!(envelope.content_type(), Some("application/json"));
        assert_eq!(delivery(envelope).json::<OrderCreated>().unwrap(), order);

        let broken = delivery(Envelope::new("{not json"));
        assert!(matches!(
            broken.json::<OrderCreated>(),
            Err(PayloadError::Decode(_))
        ));
    }
}
