use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use warren::amqp::BasicProperties;
use warren::connection::{ConnectError, Connection, ReconnectPolicy};
use warren::consumers::Delivery;
use warren::polling::{PollingQueue, QueueMessage};
use warren::transport::{Acknowledger, DeliveryStream, Dialer, Link};

/// How a delivery was settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
}

#[derive(Clone, Debug)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

/// An in-memory broker, standing in for RabbitMq.
///
/// Cloning it gives another handle on the same broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    dial_attempts: AtomicU32,
    failing_dials: AtomicU32,
    dial_delay: Mutex<Duration>,
    closed_links: AtomicU32,
    subscribe_calls: AtomicU32,
    prefetch_counts: Mutex<Vec<u16>>,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<Result<Delivery, anyhow::Error>>>>,
    next_delivery_tag: AtomicU32,
    settlements: Mutex<Vec<Settlement>>,
    published: Mutex<Vec<Published>>,
    failing_publishes: AtomicU32,
    publish_delay: Mutex<Duration>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self) -> Arc<Connection<FakeBroker>> {
        Arc::new(
            Connection::connect(self.clone(), ReconnectPolicy::default())
                .await
                .unwrap(),
        )
    }

    /// The next `n` dials are refused.
    pub fn fail_next_dials(&self, n: u32) {
        self.inner.failing_dials.store(n, Ordering::SeqCst);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.inner.dial_delay.lock().unwrap() = delay;
    }

    /// The next `n` publishes are rejected.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.inner.publish_delay.lock().unwrap() = delay;
    }

    pub fn dial_attempts(&self) -> u32 {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn closed_links(&self) -> u32 {
        self.inner.closed_links.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn prefetch_counts(&self) -> Vec<u16> {
        self.inner.prefetch_counts.lock().unwrap().clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.settlements.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.published.lock().unwrap().clone()
    }

    /// Push a message to the most recent subscription, returning its delivery tag.
    pub fn deliver(&self, payload: &str) -> u64 {
        let delivery_tag = u64::from(self.inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let delivery = Delivery::new(
            delivery_tag,
            payload.as_bytes().to_vec(),
            BasicProperties::default(),
            FakeAcker {
                broker: self.clone(),
                delivery_tag,
            },
        );
        let subscriptions = self.inner.subscriptions.lock().unwrap();
        subscriptions
            .last()
            .expect("Nobody subscribed yet")
            .send(Ok(delivery))
            .expect("The subscription was dropped");
        delivery_tag
    }

    /// Terminate every subscription, as the broker does when a channel goes away.
    pub fn drop_subscriptions(&self) {
        self.inner.subscriptions.lock().unwrap().clear();
    }

    pub async fn wait_for_subscriptions(&self, n: u32) {
        eventually(|| self.subscribe_calls() >= n).await;
    }

    pub async fn wait_for_settlements(&self, n: usize) {
        eventually(|| self.settlements().len() >= n).await;
    }
}

#[async_trait::async_trait]
impl Dialer for FakeBroker {
    type Link = FakeLink;

    async fn dial(&self) -> Result<FakeLink, ConnectError> {
        self.inner.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.dial_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .inner
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Dial(anyhow::anyhow!("Connection refused")));
        }
        Ok(FakeLink {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct FakeLink {
    broker: FakeBroker,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Link for FakeLink {
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.broker
            .inner
            .prefetch_counts
            .lock()
            .unwrap()
            .push(prefetch_count);
        Ok(())
    }

    async fn subscribe(
        &self,
        _queue_name: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker.inner.subscriptions.lock().unwrap().push(sender);
        self.broker
            .inner
            .subscribe_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let delay = *self.broker.inner.publish_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let rejected = self
            .broker
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            anyhow::bail!("Channel closed");
        }
        self.broker.inner.published.lock().unwrap().push(Published {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.inner.closed_links.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    delivery_tag: u64,
}

#[async_trait::async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Ack(self.delivery_tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        Ok(())
    }
}

impl FakeAcker {
    fn settle(&self, settlement: Settlement) {
        self.broker
            .inner
            .settlements
            .lock()
            .unwrap()
            .push(settlement);
    }
}

/// An in-memory polling queue, standing in for SQS.
#[derive(Default)]
pub struct FakeQueue {
    batches: Mutex<VecDeque<Result<Vec<QueueMessage>, String>>>,
    deleted: Mutex<Vec<String>>,
    failing_deletes: AtomicU32,
    receive_calls: AtomicU32,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, bodies: &[&str]) {
        let offset = self.batches.lock().unwrap().len();
        let batch = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| QueueMessage {
                message_id: Some(format!("message-{offset}-{i}")),
                receipt_handle: format!("receipt-{offset}-{i}"),
                body: body.to_string(),
                receive_count: 1,
            })
            .collect();
        self.batches.lock().unwrap().push_back(Ok(batch));
    }

    pub fn push_receive_error(&self, error: &str) {
        self.batches
            .lock()
            .unwrap()
            .push_back(Err(error.to_string()));
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn receive_calls(&self) -> u32 {
        self.receive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PollingQueue for FakeQueue {
    async fn receive(
        &self,
        _max_messages: u8,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, anyhow::Error> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => {
                // Long poll on an empty queue.
                tokio::time::sleep(wait).await;
                Ok(vec![])
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), anyhow::Error> {
        let rejected = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            anyhow::bail!("The receipt handle has expired");
        }
        self.deleted.lock().unwrap().push(receipt_handle.to_owned());
        Ok(())
    }
}

/// Wait until `condition` holds, failing the test after a (virtual) minute.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("The condition was not met in time");
}

