//! Audio device boundary
//!
//! Codec and audio device work happens outside this crate. The engine only
//! tells the collaborator when a call's media became active or went away.

use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioDeviceManager: Send + Sync {
    /// Bridge the call's media stream to the sound device
    async fn connect_call(&self, call_id: &CallId, remote_media: Option<SocketAddr>) -> Result<()>;

    /// Release the sound device from the call
    async fn disconnect_call(&self, call_id: &CallId) -> Result<()>;
}

/// No sound device; signalling only
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioDevice;

#[async_trait]
impl AudioDeviceManager for NullAudioDevice {
    async fn connect_call(&self, call_id: &CallId, remote_media: Option<SocketAddr>) -> Result<()> {
        debug!("Null audio: connect {} ({:?})", call_id, remote_media);
        Ok(())
    }

    async fn disconnect_call(&self, call_id: &CallId) -> Result<()> {
        debug!("Null audio: disconnect {}", call_id);
        Ok(())
    }
}
