use super::{ConnectError, ReconnectError, ReconnectPolicy};
use crate::transport::{Dialer, Link};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies one link installed on a [`Connection`].
///
/// Every successful reconnect moves the connection to a new generation.
pub type Generation = u64;

/// Where a [`Connection`] currently stands.
///
/// ```text
/// Connected ──(reconnect)──▶ Reconnecting ──(dial ok)──▶ Connected
///                                 │
///                                 └──(attempts exhausted)──▶ Disrupted ──(reconnect)──▶ Reconnecting
/// any ──(close)──▶ Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disrupted,
    Closed,
}

/// A single logical connection to the broker, shared by consumers and publishers.
///
/// # Ownership
///
/// `Connection` is meant to be put behind an `Arc` and handed by reference to every
/// [`Consumer`](crate::consumers::Consumer) and [`Publisher`](crate::publishers::Publisher)
/// that should use it. The current [`Link`] is read by many, while structural changes
/// (reconnect, close) are exclusive.
pub struct Connection<D: Dialer> {
    dialer: D,
    policy: ReconnectPolicy,
    link: RwLock<Option<Arc<D::Link>>>,
    /// Serializes reconnection episodes: at most one dial sequence runs at any time.
    reconnect_lock: Mutex<()>,
    /// Bumped every time a new link replaces the previous one.
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl<D: Dialer> Connection<D> {
    /// Open the initial link to the broker.
    ///
    /// No retries are performed: a broker that is unreachable at startup is reported
    /// straight away to the caller.
    #[tracing::instrument(name = "broker_connect", skip_all)]
    pub async fn connect(dialer: D, policy: ReconnectPolicy) -> Result<Self, ConnectError> {
        let link = dial_within(&dialer, &policy).await?;
        info!("Connected to the broker");
        let (state, _) = watch::channel(ConnectionState::Connected);
        Ok(Self {
            dialer,
            policy,
            link: RwLock::new(Some(Arc::new(link))),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            state,
        })
    }

    /// The current link, if there is one.
    ///
    /// It returns `None` while the connection is disrupted or after it has been closed.
    pub async fn link(&self) -> Option<Arc<D::Link>> {
        self.link.read().await.clone()
    }

    /// The current link, together with the generation it belongs to.
    ///
    /// Hand the generation back to [`Connection::reconnect_from`] if the link turns out to
    /// be broken.
    pub async fn link_with_generation(&self) -> (Option<Arc<D::Link>>, Generation) {
        let link = self.link.read().await;
        (link.clone(), self.generation.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions as they happen.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Replace the current link with a freshly dialed one.
    ///
    /// The previous link is closed (if it is not already), then up to
    /// [`ReconnectPolicy::max_attempts`] dials are performed with a linearly growing pause
    /// between them.
    ///
    /// Concurrent callers queue up behind each other. A caller that waited while somebody
    /// else successfully reconnected returns `Ok` without dialing again.
    pub async fn reconnect(&self) -> Result<(), ReconnectError> {
        self.reconnect_from(self.generation()).await
    }

    /// Same as [`Connection::reconnect`], for a caller that saw the link of `failed_generation`
    /// break.
    ///
    /// If the connection has moved past that generation in the meantime, the current link
    /// is left alone and `Ok` is returned straight away.
    #[tracing::instrument(name = "broker_reconnect", skip(self))]
    pub async fn reconnect_from(
        &self,
        failed_generation: Generation,
    ) -> Result<(), ReconnectError> {
        let _lock = self.reconnect_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != failed_generation {
            debug!("The connection was already re-established, skipping");
            return Ok(());
        }
        if !self.transition(ConnectionState::Reconnecting) {
            return Err(ReconnectError::Closed);
        }
        let mut episode = Episode {
            state: &self.state,
            finished: false,
        };

        let previous = self.link.write().await.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(error = ?e, "Failed to close the previous link");
            }
        }

        let max_attempts = self.policy.attempts();
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, "Reconnecting to the broker");
            match dial_within(&self.dialer, &self.policy).await {
                Ok(link) => {
                    let mut slot = self.link.write().await;
                    episode.finished = true;
                    if !self.transition(ConnectionState::Connected) {
                        drop(slot);
                        let _ = link.close().await;
                        return Err(ReconnectError::Closed);
                    }
                    *slot = Some(Arc::new(link));
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    info!(attempt, "Reconnected to the broker");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = ?e, "Reconnection attempt failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        episode.finished = true;
        self.transition(ConnectionState::Disrupted);
        error!(
            attempts = max_attempts,
            "Could not re-establish the connection to the broker"
        );
        Err(ReconnectError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Close the channel and then the connection.
    ///
    /// It can be called any number of times; only the first call does any work.
    /// A closed `Connection` is never reconnected.
    #[tracing::instrument(name = "broker_close", skip_all)]
    pub async fn close(&self) {
        self.state.send_replace(ConnectionState::Closed);
        let link = self.link.write().await.take();
        if let Some(link) = link {
            match link.close().await {
                Ok(()) => info!("Closed the connection to the broker"),
                Err(e) => warn!(error = ?e, "Failed to cleanly close the connection to the broker"),
            }
        }
    }

    /// Spawn a task that closes the connection as soon as `cancellation` fires.
    pub fn close_on_cancel(self: &Arc<Self>, cancellation: CancellationToken) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            cancellation.cancelled().await;
            connection.close().await;
        })
    }

    /// Move to `next`, unless the connection has been closed.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        })
    }
}

/// Dial once, giving up after the policy's connect timeout.
///
/// A link that completes after the deadline is dropped.
async fn dial_within<D: Dialer>(
    dialer: &D,
    policy: &ReconnectPolicy,
) -> Result<D::Link, ConnectError> {
    tokio::time::timeout(policy.connect_timeout, dialer.dial())
        .await
        .map_err(|_| ConnectError::Timeout(policy.connect_timeout))?
}

/// A reconnection episode in progress.
///
/// If the episode is abandoned halfway (its future is dropped), the connection is marked as
/// disrupted rather than left in `Reconnecting` forever.
struct Episode<'a> {
    state: &'a watch::Sender<ConnectionState>,
    finished: bool,
}

impl Drop for Episode<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.state.send_if_modified(|current| {
            if *current != ConnectionState::Reconnecting {
                return false;
            }
            warn!("A reconnection was abandoned before completing");
            *current = ConnectionState::Disrupted;
            true
        });
    }
}
