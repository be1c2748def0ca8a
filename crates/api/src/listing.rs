//! Folder listing: sub-folders and files fetched together.

use tracing::warn;

use crate::endpoint::TransferEndpoint;
use crate::error::EndpointError;
use crate::types::FolderListing;

/// Fetches the sub-folders and files of `folder_id` concurrently.
///
/// A failure on either side degrades that side to an empty list so the
/// other half is still shown.
pub async fn fetch_listing(endpoint: &dyn TransferEndpoint, folder_id: Option<i64>) -> FolderListing {
    let (folders, files) = tokio::join!(endpoint.list_folders(folder_id), endpoint.list_files(folder_id));
    FolderListing::new(
        degrade(folders, folder_id, "folder"),
        degrade(files, folder_id, "file"),
    )
}

/// Like [`fetch_listing`], but fails when both sides fail.
///
/// Used for background refreshes, where an all-empty result would wipe out
/// a good cached listing.
pub async fn try_fetch_listing(
    endpoint: &dyn TransferEndpoint,
    folder_id: Option<i64>,
) -> Result<FolderListing, EndpointError> {
    let (folders, files) = tokio::join!(endpoint.list_folders(folder_id), endpoint.list_files(folder_id));
    match (folders, files) {
        (Err(e), Err(_)) => Err(e),
        (folders, files) => Ok(FolderListing::new(
            degrade(folders, folder_id, "folder"),
            degrade(files, folder_id, "file"),
        )),
    }
}

fn degrade<T>(result: Result<Vec<T>, EndpointError>, folder_id: Option<i64>, what: &str) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!(?folder_id, error = %e, "{what} listing failed");
        Vec::new()
    })
}
