use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::http::error::Error;

pub mod api_client;
pub mod bulk_import;
pub mod bulk_import_client;
pub mod database;
pub mod database_client;
pub mod error;
pub mod job;
pub mod job_client;
pub mod response;

/// Joins percent-encoded path segments, e.g. `["v3", "job", "show", id]`.
pub(crate) fn api_path(segments: &[&str]) -> Result<String, Error> {
    let mut url = url::Url::parse("http://localhost/").map_err(|e| Error::Validation(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| Error::Validation("cannot build request path".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.path().to_string())
}

/// Accepts a string, a number or null.
fn from_str_option<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s: Result<Value, _> = Deserialize::deserialize(deserializer);
    match s {
        Ok(Value::String(s)) => T::from_str(&s).map_err(de::Error::custom).map(Some),
        Ok(Value::Number(num)) => T::from_str(&num.to_string()).map_err(de::Error::custom).map(Some),
        Ok(Value::Null) => Ok(None),
        Ok(_) => Err(de::Error::custom("Incorrect type")),
        Err(_) => Ok(None),
    }
}

/// `2013-04-01 12:34:56 UTC`, with RFC 3339 accepted as well.
pub(crate) fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");
    match PrimitiveDateTime::parse(s, &format) {
        Ok(v) => Some(v.assume_utc()),
        Err(_) => OffsetDateTime::parse(s, &Rfc3339).ok(),
    }
}

fn timestamp_option<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(Value::String(s)) => parse_timestamp(&s),
        _ => None,
    })
}

/// Missing or unparsable timestamps fall back to the epoch.
fn timestamp_or_epoch<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(timestamp_option(deserializer)?.unwrap_or(OffsetDateTime::UNIX_EPOCH))
}

fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}
