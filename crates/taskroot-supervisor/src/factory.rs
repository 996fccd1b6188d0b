//! Resolving how a process reaches the event store.
//!
//! The owning process holds the store in-process. Every other process gets a
//! serializable [`StoreAccess`] descriptor and turns it into an
//! [`RpcClient`] talking to the owner.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use taskroot_core::{DatabaseConfig, Error, EventStore, Result, RpcConfig, RpcEndpoint, RpcTransport};
use taskroot_db::SqliteStore;
use taskroot_rpc::RpcClient;

/// Serializable description of how to reach the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StoreAccess {
    /// Open the dataset directly. Only valid for the process owning it.
    Owned { db_path: Option<PathBuf> },
    /// Connect to the owning process over RPC.
    Remote(RpcConfig),
}

impl StoreAccess {
    /// Remote access to a server listening on `endpoint`, keeping auth and
    /// limits from `base`.
    pub fn remote(endpoint: &RpcEndpoint, base: &RpcConfig) -> Self {
        let mut config = base.clone();
        match endpoint {
            RpcEndpoint::Unix(path) => {
                config.transport = RpcTransport::Unix;
                config.socket_path = Some(path.clone());
            }
            RpcEndpoint::Tcp { host, port } => {
                config.transport = RpcTransport::Tcp;
                config.host = host.clone();
                config.port = *port;
            }
        }
        Self::Remote(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolve into a ready store.
    pub async fn open(&self) -> Result<Arc<dyn EventStore>> {
        match self {
            Self::Owned { db_path } => {
                let config = DatabaseConfig {
                    db_path: db_path.clone(),
                    ..DatabaseConfig::default()
                };
                let store = SqliteStore::open(&config).await?;
                store.initialize().await?;
                Ok(Arc::new(store))
            }
            Self::Remote(config) => {
                let client = RpcClient::connect(config).await?;
                debug!(
                    subsystem = "supervisor",
                    endpoint = %client.endpoint(),
                    "Connected to event store"
                );
                Ok(Arc::new(client))
            }
        }
    }
}

/// How the current process obtains its store handle.
#[derive(Clone)]
pub enum StoreFactory {
    InProcess(Arc<dyn EventStore>),
    Access(StoreAccess),
}

impl StoreFactory {
    pub async fn open(&self) -> Result<Arc<dyn EventStore>> {
        match self {
            Self::InProcess(store) => Ok(store.clone()),
            Self::Access(access) => access.open().await,
        }
    }

    /// Descriptor handed to a child process.
    ///
    /// Children never get owned access to a dataset that is already held,
    /// so an in-process store is reached over the RPC server at `served`.
    pub fn child_access(&self, served: Option<(&RpcEndpoint, &RpcConfig)>) -> Result<StoreAccess> {
        match (self, served) {
            (_, Some((endpoint, base))) => Ok(StoreAccess::remote(endpoint, base)),
            (Self::Access(access @ StoreAccess::Remote(_)), None) => Ok(access.clone()),
            _ => Err(Error::Config(
                "children need an RPC endpoint to reach the event store".into(),
            )),
        }
    }
}

impl std::fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("StoreFactory::InProcess"),
            Self::Access(access) => f.debug_tuple("StoreFactory::Access").field(access).finish(),
        }
    }
}
