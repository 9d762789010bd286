use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BulkImportStatus {
    #[default]
    Uploading,
    Performing,
    Ready,
    Committing,
    Committed,
    #[serde(other)]
    Unknown,
}

impl BulkImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkImportStatus::Uploading => "uploading",
            BulkImportStatus::Performing => "performing",
            BulkImportStatus::Ready => "ready",
            BulkImportStatus::Committing => "committing",
            BulkImportStatus::Committed => "committed",
            BulkImportStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BulkImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BulkImportDetail {
    pub name: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub status: BulkImportStatus,
    #[serde(default)]
    pub upload_frozen: bool,
    /// Job of the last perform, if any.
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub job_id: Option<String>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub valid_records: Option<u64>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub error_records: Option<u64>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub valid_parts: Option<u64>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub error_parts: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ListBulkImportsResponse {
    #[serde(default)]
    pub bulk_imports: Vec<BulkImportDetail>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ListPartsResponse {
    #[serde(default)]
    pub parts: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PerformResponse {
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub job_id: Option<String>,
}
