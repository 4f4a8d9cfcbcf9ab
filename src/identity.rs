//! Process-local peer identifier assignment.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OnceCell, watch};

use crate::calls::CallError;

/// Opaque address the peer channel substrate routes connection requests to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The peer-connection substrate that hands out identifiers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn request_identifier(&self) -> Result<PeerId, CallError>;
}

/// Assigns the local identifier once and publishes it to local consumers.
pub struct IdentityRegistry {
    provider: Arc<dyn IdentityProvider>,
    assigned: OnceCell<PeerId>,
    published: watch::Sender<Option<PeerId>>,
}

impl IdentityRegistry {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        let (published, _) = watch::channel(None);
        Arc::new(Self {
            provider,
            assigned: OnceCell::new(),
            published,
        })
    }

    /// Return the identifier, requesting one from the substrate on first use.
    ///
    /// Concurrent callers share a single request. A failed request leaves the
    /// registry unassigned so the next call tries again.
    pub async fn initialize(&self) -> Result<PeerId, CallError> {
        let id = self
            .assigned
            .get_or_try_init(|| async {
                debug!(target: "Call/Identity", "Requesting peer identifier");
                let id = self.provider.request_identifier().await?;
                info!(target: "Call/Identity", "Assigned peer identifier {id}");
                Ok::<_, CallError>(id)
            })
            .await?;

        self.published.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(id.clone());
                true
            } else {
                false
            }
        });
        Ok(id.clone())
    }

    /// The identifier, or `None` while unassigned.
    pub fn current(&self) -> Option<PeerId> {
        self.assigned.get().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PeerId>> {
        self.published.subscribe()
    }
}
