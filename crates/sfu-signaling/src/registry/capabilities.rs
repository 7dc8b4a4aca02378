//! Capability registry.
//!
//! Holds the room's routing context. The router is created on the first
//! `join-room` and cached for the lifetime of the process; concurrent first
//! callers share a single engine initialization.

use crate::engine::{MediaCodec, MediaEngine, RouterCapabilities, RtpCapabilities};
use crate::errors::SignalingError;

use common::types::RouterId;
use tokio::sync::OnceCell;
use tracing::{error, info};

pub struct CapabilityRegistry {
    codecs: Vec<MediaCodec>,
    room: OnceCell<RouterCapabilities>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new(codecs: Vec<MediaCodec>) -> Self {
        Self {
            codecs,
            room: OnceCell::new(),
        }
    }

    /// Return the room descriptor, creating the router on first use.
    ///
    /// Any engine failure here is fatal: every peer depends on the router.
    pub async fn ensure_room(
        &self,
        engine: &dyn MediaEngine,
    ) -> Result<&RouterCapabilities, SignalingError> {
        self.room
            .get_or_try_init(|| async {
                match engine.create_router(&self.codecs).await {
                    Ok(room) => {
                        info!(
                            target: "sfu.gateway",
                            router_id = %room.router_id,
                            engine = engine.name(),
                            codecs = self.codecs.len(),
                            "Room routing context created"
                        );
                        Ok(room)
                    }
                    Err(e) => {
                        error!(target: "sfu.gateway", error = %e, "Failed to create room router");
                        Err(SignalingError::EngineFatal(format!(
                            "room initialization failed: {e}"
                        )))
                    }
                }
            })
            .await
    }

    /// The cached descriptor, if the room exists.
    #[must_use]
    pub fn get(&self) -> Option<&RouterCapabilities> {
        self.room.get()
    }

    #[must_use]
    pub fn router_id(&self) -> Option<RouterId> {
        self.room.get().map(|room| room.router_id)
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<&RtpCapabilities> {
        self.room.get().map(|room| &room.rtp_capabilities)
    }
}
