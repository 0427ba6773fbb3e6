//! Item sources: turn a collection identifier into an ordered list of work items.
//!
//! A source only has to answer one page at a time ([`ItemSource::list_page`]);
//! [`fetch_all`] drives the pagination and enforces the all-or-nothing policy:
//! either the complete ordered list is produced, or the run gets a
//! [`Error::SourceUnavailable`] before anything is dispatched.

mod youtube;

pub use youtube::YouTubePlaylistSource;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::{Error, Result, SourceError};
use crate::types::WorkItem;

/// One page of a collection listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemPage {
    /// Items on this page, in collection order
    pub items: Vec<WorkItem>,
    /// Token for the next page; None on the last page
    pub next_page_token: Option<String>,
}

/// Listing service abstraction
///
/// Implementations hold their own credential; callers only pass the collection
/// identifier and the page token returned by the previous call.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Fetch a single page of the collection
    async fn list_page(
        &self,
        collection_id: &str,
        page_token: Option<&str>,
    ) -> std::result::Result<ItemPage, SourceError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Fetch every page of a collection and concatenate them in received order
///
/// # Errors
///
/// Returns [`Error::SourceUnavailable`] if any page fails or the service keeps
/// handing back a page token it already returned.
pub async fn fetch_all(source: &dyn ItemSource, collection_id: &str) -> Result<Vec<WorkItem>> {
    let unavailable = |source_err: SourceError| Error::SourceUnavailable {
        collection_id: collection_id.to_string(),
        source: source_err,
    };

    let mut items = Vec::new();
    let mut seen_tokens = HashSet::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source
            .list_page(collection_id, page_token.as_deref())
            .await
            .map_err(unavailable)?;
        pages += 1;

        tracing::debug!(
            source = source.name(),
            collection_id,
            page = pages,
            items = page.items.len(),
            "fetched listing page"
        );
        items.extend(page.items);

        match page.next_page_token {
            Some(token) if !token.is_empty() => {
                if !seen_tokens.insert(token.clone()) {
                    return Err(unavailable(SourceError::PaginationLoop(token)));
                }
                page_token = Some(token);
            }
            _ => break,
        }
    }

    tracing::debug!(source = source.name(), collection_id, pages, "listing complete");
    Ok(items)
}
