use serde::Deserialize;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DatabaseDetail {
    pub name: String,
    /// Number of records over all tables.
    #[serde(default)]
    pub count: u64,
    #[serde(deserialize_with = "crate::http::timestamp_or_epoch", default = "crate::http::epoch")]
    pub created_at: OffsetDateTime,
    #[serde(deserialize_with = "crate::http::timestamp_or_epoch", default = "crate::http::epoch")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub permission: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ListDatabasesResponse {
    #[serde(default)]
    pub databases: Vec<DatabaseDetail>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ImportResult {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    /// Seconds the service spent on the import.
    #[serde(default)]
    pub elapsed_time: f64,
}
