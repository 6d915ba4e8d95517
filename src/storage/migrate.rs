use serde::Serialize;

use super::types::{EntryFilter, StoreError};
use super::Store;

/// Counts copied by [`migrate_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub feeds: u64,
    pub entries: u64,
}

/// Copies every feed and entry from `src` into `dst`, preserving ids,
/// timestamps and read state.
///
/// The destination is expected to be empty; a clash surfaces as
/// `DuplicateUrl` / `DuplicateEntry` and stops the copy.
pub async fn migrate_data(src: &dyn Store, dst: &dyn Store) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport::default();

    for feed in src.list_feeds().await? {
        dst.create_feed(&feed).await?;
        report.feeds += 1;

        let entries = src.list_entries(&EntryFilter::for_feed(feed.id.clone())).await?;
        for entry in &entries {
            dst.create_entry(entry).await?;
        }
        report.entries += entries.len() as u64;

        tracing::info!(
            feed_id = %feed.id,
            entries = entries.len(),
            "migrated feed"
        );
    }

    Ok(report)
}
