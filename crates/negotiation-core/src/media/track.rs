//! Local and remote tracks
//!
//! A local track wraps a caller-owned media source. The source outlives the
//! track and may back several tracks; transceivers only hold the track by
//! `Arc`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::MediaKind;
use crate::error::{Error, Result};

/// Opaque capture device or synthetic source owned by the caller
pub trait MediaSource: Send + Sync + fmt::Debug {
    /// Kind of media this source produces
    fn kind(&self) -> MediaKind;

    /// Human readable label, used in logs
    fn label(&self) -> &str {
        ""
    }
}

/// Track fed by a local media source
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    name: String,
    source: Arc<dyn MediaSource>,
}

impl LocalTrack {
    pub fn new(name: impl Into<String>, source: Arc<dyn MediaSource>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source,
        }
    }

    /// Unique id, rendered as the msid track id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    pub fn source(&self) -> &Arc<dyn MediaSource> {
        &self.source
    }
}

/// Track announced by the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// msid track id, or a synthesized `<kind>-<mline>` id
    pub id: String,
    /// msid stream id
    pub stream_id: Option<String>,
    pub kind: MediaKind,
}

/// Turns caller sources into tracks and releases them again
#[async_trait]
pub trait MediaSourceProvider: Send + Sync {
    /// Create a local track backed by `source`
    async fn attach(&self, source: Arc<dyn MediaSource>, name: &str) -> Result<Arc<LocalTrack>>;

    /// Called once the peer connection no longer uses `track`
    async fn release(&self, track: Arc<LocalTrack>);
}

/// Provider that wraps sources directly and has nothing to release
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMediaProvider;

#[async_trait]
impl MediaSourceProvider for PassthroughMediaProvider {
    async fn attach(&self, source: Arc<dyn MediaSource>, name: &str) -> Result<Arc<LocalTrack>> {
        if name.is_empty() {
            return Err(Error::invalid_track("track name must not be empty"));
        }
        debug!("Attaching {} source '{}' as track '{}'", source.kind(), source.label(), name);
        Ok(Arc::new(LocalTrack::new(name, source)))
    }

    async fn release(&self, track: Arc<LocalTrack>) {
        debug!("Released track '{}' ({})", track.name(), track.id());
    }
}
