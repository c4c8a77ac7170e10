use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::AmqpLink;
use crate::connection::ConnectError;
use crate::transport::Dialer;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the [`Dialer`] used by [`Connection`](crate::connection::Connection)
/// to open (and re-open) links to RabbitMq.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// Printable version of the uri, password excluded.
    redacted_uri: String,
    connection_name: Option<String>,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// The connection timeout is not enforced here: [`Connection`](crate::connection::Connection)
    /// bounds every dial with [`RabbitMqSettings::reconnect_policy`].
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, ConnectError> {
        let uri: AMQPUri = settings
            .amqp_uri()
            .parse()
            .map_err(|e: String| ConnectError::InvalidConfiguration(e))?;
        let tls = settings
            .tls
            .as_ref()
            .map(|tls_settings| -> Result<Tls, anyhow::Error> {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq.")?;
                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()
            .map_err(|e| ConnectError::InvalidConfiguration(format!("{e:#}")))?;

        Ok(Self {
            uri,
            redacted_uri: settings.redacted_uri(),
            connection_name: settings.connection_name.clone(),
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS Connector for the connection factory, along with the expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    fn properties(&self) -> ConnectionProperties {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    /// Create a new link to a RabbitMq broker: a connection, then a channel on it.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(uri = %self.redacted_uri))]
    pub async fn new_link(&self) -> Result<AmqpLink, ConnectError> {
        let properties = self.properties();
        let connection = match &self.tls {
            None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
            Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
        }
        .map_err(|e| ConnectError::Dial(e.into()))?;

        // The broker (or the network) may drop the connection at any point: lapin reports it
        // here, while recovery is driven by whoever notices their stream or publish failing.
        connection.on_error(|e| {
            warn!(error = ?e, "RabbitMq connection closed unexpectedly");
        });

        match connection.create_channel().await {
            Ok(channel) => {
                info!("Opened a new connection and channel to RabbitMq");
                Ok(AmqpLink::new(connection, channel))
            }
            Err(e) => {
                let _ = connection.close(200, "failed to open a channel").await;
                Err(ConnectError::Channel(e.into()))
            }
        }
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake, expecting the configured domain on the
                    // server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Dialer for ConnectionFactory {
    type Link = AmqpLink;

    async fn dial(&self) -> Result<AmqpLink, ConnectError> {
        self.new_link().await
    }
}
