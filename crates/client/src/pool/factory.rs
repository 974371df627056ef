use std::sync::Arc;

use async_trait::async_trait;
use spacelink_domain::ServerConfig;

use crate::connection::{Connection, ConnectionOptions};
use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::transport::Connector;

/// Builds connected [`Connection`]s for the pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<Connection>, ClientError>;
}

/// Factory over a transport, a shared credential store and fixed options.
pub struct DefaultConnectionFactory {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    options: ConnectionOptions,
}

impl DefaultConnectionFactory {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            connector,
            credentials,
            options,
        }
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<Connection>, ClientError> {
        let connection = Arc::new(Connection::new(
            config.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            self.options.clone(),
        ));
        connection.connect().await?;
        Ok(connection)
    }
}
