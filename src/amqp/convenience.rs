use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};

/// The header the broker uses to report how many times a message has been delivered.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// How many times the broker reports this message has been delivered, read from the
    /// [`DELIVERY_COUNT_HEADER`] header.
    ///
    /// A missing header, a negative number or a value that is not a number all count as `0`.
    /// The value is advisory: nothing in this crate dead-letters based on it.
    fn delivery_count(&self) -> u32 {
        self.get_header(DELIVERY_COUNT_HEADER)
            .and_then(header_as_count)
            .unwrap_or(0)
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

fn header_as_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).parse().ok()?,
        AMQPValue::ShortString(s) => s.as_str().parse().ok()?,
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` does not give mutable access to headers, hence we clone them and consume
/// `properties` to make sure the caller does not re-use the stale collection.
///
/// # Example
///
/// ```rust
/// use warren::amqp::types::{AMQPValue, ShortString};
/// use warren::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
/// let header_value = AMQPValue::LongString("tenant-a".into());
///
/// let properties = set_header(properties, "x-tenant", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "x-tenant".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
