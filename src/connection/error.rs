use std::time::Duration;

/// Error returned when a link to the broker cannot be established.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("Timed out after {0:?} while trying to connect to the broker")]
    Timeout(Duration),
    #[error("Failed to connect to the broker")]
    Dial(#[source] anyhow::Error),
    #[error("Failed to open a channel on the broker connection")]
    Channel(#[source] anyhow::Error),
    #[error("Invalid broker configuration: {0}")]
    InvalidConfiguration(String),
}

/// Error returned by [`Connection::reconnect`](super::Connection::reconnect).
#[derive(thiserror::Error, Debug)]
pub enum ReconnectError {
    #[error("Gave up reconnecting to the broker after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: Option<ConnectError>,
    },
    #[error("The connection has been closed and will not be re-established")]
    Closed,
}
