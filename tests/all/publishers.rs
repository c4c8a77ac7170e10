use crate::helpers::FakeBroker;
use fake::{Fake, Faker};
use std::time::Duration;
use warren::connection::ReconnectError;
use warren::publishers::{MessageEnvelope, Publisher, PublisherError};

#[derive(serde::Serialize)]
struct Invoice {
    id: u32,
    amount_in_minor: u64,
}

#[tokio::test]
async fn values_are_published_as_json() {
    // Arrange
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await).build();
    let invoice = Invoice {
        id: Faker.fake(),
        amount_in_minor: Faker.fake(),
    };

    // Act
    publisher.publish("invoices", &invoice).await.unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, "");
    assert_eq!(message.routing_key, "invoices");
    assert_eq!(message.payload, serde_json::to_vec(&invoice).unwrap());
    assert_eq!(
        message
            .properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str()),
        Some("application/json")
    );
    assert!(message.properties.timestamp().is_some());
    assert!(message.properties.message_id().is_some());
}

#[tokio::test]
async fn the_configured_exchange_is_used() {
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await)
        .exchange_name("billing")
        .build();

    publisher.publish("invoices.created", "created").await.unwrap();

    let published = broker.published();
    assert_eq!(published[0].exchange, "billing");
    assert_eq!(published[0].routing_key, "invoices.created");
    assert_eq!(published[0].payload, br#""created""#.to_vec());
}

#[tokio::test]
async fn a_failed_publish_is_retried_once_after_reconnecting() {
    // Arrange
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await).build();
    broker.fail_next_publishes(1);

    // Act
    let outcome = publisher.publish("invoices", &42).await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.dial_attempts(), 2);
}

#[tokio::test]
async fn a_second_failure_is_returned_to_the_caller() {
    // Arrange
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await).build();
    broker.fail_next_publishes(2);

    // Act
    let outcome = publisher.publish("invoices", &42).await;

    // Assert
    assert!(matches!(outcome, Err(PublisherError::GenericError(_))));
    assert!(broker.published().is_empty());
    assert_eq!(broker.dial_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn a_failed_reconnection_is_returned_to_the_caller() {
    // Arrange
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await).build();
    broker.fail_next_publishes(1);
    broker.fail_next_dials(u32::MAX);

    // Act
    let outcome = publisher.publish("invoices", &42).await;

    // Assert
    assert!(matches!(
        outcome,
        Err(PublisherError::ReconnectError(ReconnectError::Exhausted { .. }))
    ));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_publish_that_hangs_times_out() {
    // Arrange
    let broker = FakeBroker::new();
    let publisher = Publisher::builder(broker.connect().await)
        .publish_timeout(Duration::from_secs(3))
        .build();
    broker.set_publish_delay(Duration::from_secs(60));

    // Act
    let outcome = publisher
        .publish_envelope(MessageEnvelope::default().with_routing_key("invoices"))
        .await;

    // Assert
    assert!(matches!(outcome, Err(PublisherError::TimeoutError(_))));
    // The hanging attempt, then the single retry after reconnecting.
    assert_eq!(broker.dial_attempts(), 2);
}
