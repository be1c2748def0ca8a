//! Wire types of the remote store.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EndpointError;

/// A file stored on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: i64,
    #[serde(rename = "filename", default)]
    pub name: String,
    #[serde(rename = "file_size", default)]
    pub size: u64,
    #[serde(rename = "file_type", default)]
    pub mime_hint: Option<String>,
    #[serde(rename = "upload_date", default)]
    pub created_at: Option<String>,
    #[serde(rename = "folder_id", default)]
    pub parent_folder_id: Option<i64>,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
}

impl FileDescriptor {
    /// Human-readable size: `B`, `KB` or `MB` with one decimal.
    pub fn formatted_size(&self) -> String {
        format_size(self.size)
    }
}

/// A folder stored on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderDescriptor {
    pub id: i64,
    #[serde(rename = "folder_name", default)]
    pub name: String,
    #[serde(rename = "created_date", default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub parent_folder_id: Option<i64>,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
}

/// Contents of one folder: sub-folders and files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderListing {
    pub folders: Vec<FolderDescriptor>,
    pub files: Vec<FileDescriptor>,
}

impl FolderListing {
    pub fn new(folders: Vec<FolderDescriptor>, files: Vec<FileDescriptor>) -> Self {
        Self { folders, files }
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }
}

/// Response envelope used by every JSON endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

impl ApiResponse {
    /// Parses an envelope, mapping malformed JSON to a protocol error.
    pub(crate) fn parse(body: &str) -> Result<Self, EndpointError> {
        serde_json::from_str(body).map_err(|e| EndpointError::protocol(e.to_string(), body))
    }

    /// Returns the payload of a successful envelope.
    ///
    /// `success: false` is reported as a protocol error carrying the
    /// server's `error` text.
    pub(crate) fn into_data(self, body: &str, what: &str) -> Result<Option<serde_json::Value>, EndpointError> {
        if self.success {
            Ok(self.data)
        } else {
            let reason = self.error.unwrap_or_else(|| format!("{what} rejected by server"));
            Err(EndpointError::protocol(reason, body))
        }
    }
}

/// Extracts `data.<key>` (or a bare array in `data`) as a list of `T`.
///
/// Items that fail to deserialize are skipped with a warning so one bad
/// record does not hide the rest of the folder.
pub(crate) fn parse_list<T: serde::de::DeserializeOwned>(
    data: Option<serde_json::Value>,
    key: &str,
) -> Vec<T> {
    let items = match data {
        Some(serde_json::Value::Object(mut map)) => match map.remove(key) {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Some(serde_json::Value::Array(items)) => items,
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(list = key, error = %e, "skipping malformed list item");
                None
            }
        })
        .collect()
}

/// Guesses a MIME type from a file name's extension.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Formats a byte count the way the file list shows it.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_descriptor_uses_server_field_names() {
        let json = r#"{
            "id": 7,
            "filename": "report.pdf",
            "file_size": 2048,
            "file_type": "application/pdf",
            "upload_date": "2024-05-01T10:00:00",
            "share_token": null,
            "share_expiry": null,
            "owner_id": 3,
            "folder_id": 12
        }"#;
        let file: FileDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(file.id, 7);
        assert_eq!(file.name, "report.pdf");
        assert_eq!(file.size, 2048);
        assert_eq!(file.mime_hint.as_deref(), Some("application/pdf"));
        assert_eq!(file.parent_folder_id, Some(12));
        assert_eq!(file.owner_id, 3);
    }

    #[test]
    fn folder_descriptor_root_parent_is_none() {
        let json = r#"{"id": 1, "folder_name": "Photos", "created_date": null,
                       "owner_id": 3, "parent_folder_id": null}"#;
        let folder: FolderDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(folder.name, "Photos");
        assert!(folder.parent_folder_id.is_none());
    }

    #[test]
    fn parse_list_from_object_key() {
        let data = serde_json::json!({
            "files": [{"id": 1, "filename": "a"}, {"id": 2, "filename": "b"}],
            "count": 2
        });
        let files: Vec<FileDescriptor> = parse_list(Some(data), "files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].name, "b");
    }

    #[test]
    fn parse_list_from_bare_array() {
        let data = serde_json::json!([{"id": 5, "filename": "x"}]);
        let files: Vec<FileDescriptor> = parse_list(Some(data), "files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, 5);
    }

    #[test]
    fn parse_list_skips_malformed_items() {
        let data = serde_json::json!({
            "folders": [{"id": "not-a-number"}, {"id": 4, "folder_name": "ok"}]
        });
        let folders: Vec<FolderDescriptor> = parse_list(Some(data), "folders");
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, 4);
    }

    #[test]
    fn parse_list_missing_data_is_empty() {
        let files: Vec<FileDescriptor> = parse_list(None, "files");
        assert!(files.is_empty());
    }

    #[test]
    fn envelope_failure_becomes_protocol_error() {
        let body = r#"{"success": false, "data": null, "error": "quota exceeded"}"#;
        let resp = ApiResponse::parse(body).unwrap();
        let err = resp.into_data(body, "upload").unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn envelope_malformed_json() {
        let err = ApiResponse::parse("<html>").unwrap_err();
        assert!(matches!(err, EndpointError::Protocol { .. }));
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(mime_for_name("photo.JPG"), "image/jpeg");
        assert_eq!(mime_for_name("notes.txt"), "text/plain");
        assert_eq!(mime_for_name("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mime_for_name("README"), "application/octet-stream");
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
