//! Item processors: the slow, external operation performed for each work item
//!
//! A processor drives some external agent (a browser, in the shipped
//! implementation) until the download of one item has been *triggered*. The
//! agent usually has to stay alive while the file is still being written, so
//! [`ItemProcessor::process`] hands back an [`AgentLease`] that the worker pool
//! keeps until the completion detector has finished, and then releases.

mod webdriver;
mod wire;

pub use webdriver::WebDriverProcessor;
pub use wire::{WebDriverClient, WebDriverError};

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessorError;
use crate::types::WorkItem;

/// Keeps the external agent of one item alive until released
///
/// Dropping a lease without calling [`AgentLease::release`] must still free the
/// agent (best effort, without waiting for it).
#[async_trait]
pub trait AgentLease: Send {
    /// Tear the agent down and wait for it to exit
    async fn release(self: Box<Self>);
}

/// Lease for processors that hold nothing between triggering and completion
#[derive(Debug, Default)]
pub struct NoAgent;

#[async_trait]
impl AgentLease for NoAgent {
    async fn release(self: Box<Self>) {}
}

/// Performs the external interaction for one work item
///
/// Implementations write into `output_dir` only, return once the download has
/// been triggered, and check `cancel` between steps. On error, the agent must
/// already be released when the error is returned.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Trigger the download of `item` into `output_dir`
    async fn process(
        &self,
        item: &WorkItem,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn AgentLease>, ProcessorError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}
