//! Change feed envelope and the feeds the processor can read from.

use std::collections::VecDeque;

use canopy_core::Node;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeState {
    Exists,
    DoesNotExist,
    Error,
    InitialStateSkipped,
}

/// One element change. A change with `continued == false` closes the
/// atomic group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub element: String,
    pub state: ChangeState,
    pub continued: bool,
    /// JSON-encoded object for `Exists`; ignored otherwise.
    pub payload: Vec<u8>,
    pub resume_marker: Option<Vec<u8>>,
}

impl Change {
    pub fn new(element: impl Into<String>, state: ChangeState) -> Self {
        Self { element: element.into(), state, continued: false, payload: Vec::new(), resume_marker: None }
    }

    /// `Exists` change carrying `node` as its JSON payload.
    pub fn node(element: impl Into<String>, node: &Node) -> serde_json::Result<Self> {
        let payload = serde_json::to_vec(node)?;
        Ok(Self::new(element, ChangeState::Exists).with_payload(payload))
    }

    pub fn removed(element: impl Into<String>) -> Self {
        Self::new(element, ChangeState::DoesNotExist)
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn continued(mut self, continued: bool) -> Self {
        self.continued = continued;
        self
    }

    pub fn with_marker(mut self, marker: impl Into<Vec<u8>>) -> Self {
        self.resume_marker = Some(marker.into());
        self
    }
}

pub type ChangeBatch = Vec<Change>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed closed")]
    Closed,
    #[error("feed cancelled")]
    Cancelled,
    #[error("feed transport: {0}")]
    Transport(String),
}

/// Source of change batches. One consumer at a time.
#[async_trait::async_trait]
pub trait ChangeFeed: Send {
    async fn receive(&mut self) -> Result<ChangeBatch, FeedError>;
    /// Stop the feed; later receives report [`FeedError::Cancelled`].
    fn cancel(&mut self);
}

/// Adapts a `futures` stream of batches. Stream exhaustion reads as `Closed`.
pub struct StreamFeed<S> {
    inner: Option<S>,
}

impl<S> StreamFeed<S>
where
    S: Stream<Item = Result<ChangeBatch, FeedError>> + Send + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { inner: Some(stream) }
    }
}

#[async_trait::async_trait]
impl<S> ChangeFeed for StreamFeed<S>
where
    S: Stream<Item = Result<ChangeBatch, FeedError>> + Send + Unpin,
{
    async fn receive(&mut self) -> Result<ChangeBatch, FeedError> {
        match self.inner.as_mut() {
            Some(s) => s.next().await.unwrap_or(Err(FeedError::Closed)),
            None => Err(FeedError::Cancelled),
        }
    }

    fn cancel(&mut self) {
        self.inner = None;
    }
}

/// In-memory feed replaying a fixed script of batches.
///
/// Once the script is exhausted it either reports `Closed` or, when held
/// open, blocks forever like a quiet upstream would.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    script: VecDeque<Result<ChangeBatch, FeedError>>,
    hold_open: bool,
    cancelled: bool,
}

impl ScriptedFeed {
    pub fn new<I: IntoIterator<Item = ChangeBatch>>(batches: I) -> Self {
        Self { script: batches.into_iter().map(Ok).collect(), ..Self::default() }
    }

    pub fn push(&mut self, batch: ChangeBatch) {
        self.script.push_back(Ok(batch));
    }

    pub fn push_error(&mut self, err: FeedError) {
        self.script.push_back(Err(err));
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn was_cancelled(&self) -> bool { self.cancelled }

    pub fn remaining(&self) -> usize { self.script.len() }
}

#[async_trait::async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn receive(&mut self) -> Result<ChangeBatch, FeedError> {
        if self.cancelled {
            return Err(FeedError::Cancelled);
        }
        match self.script.pop_front() {
            Some(item) => item,
            None if self.hold_open => std::future::pending().await,
            None => Err(FeedError::Closed),
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}
