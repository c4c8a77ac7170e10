use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};
use lapin::BasicProperties;
use serde::Serialize;

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to be published via [`Publisher`](super::Publisher).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageEnvelope {
    // The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    // The name of the exchange we are publishing the message to.
    // The empty string is the default exchange, which routes by queue name.
    pub exchange_name: String,
    // The routing key used by the exchange to determine where the message should go.
    pub routing_key: String,
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    /// Serialize `value` as JSON and tag the envelope with the matching content type.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::default()
            .with_payload(serde_json::to_vec(value)?)
            .with_content_type(JSON_CONTENT_TYPE.into()))
    }

    #[must_use]
    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    #[must_use]
    pub fn with_exchange_name(mut self, value: impl Into<String>) -> Self {
        self.exchange_name = value.into();
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, value: impl Into<String>) -> Self {
        self.routing_key = value.into();
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    #[must_use]
    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    #[must_use]
    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    /// 2 makes the message persistent.
    #[must_use]
    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    #[must_use]
    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    #[must_use]
    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    #[must_use]
    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }
}
