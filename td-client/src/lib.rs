//! # td-client
//!
//! Client library for a hosted big-data query and import service.
//!
//! * Authenticated HTTP transport with bounded exponential-backoff retry.
//! * Query jobs: submit, wait with a client-side timeout, kill, stream results.
//! * Bulk-import sessions: upload parts, freeze, perform, commit.
//! * MessagePack record encoding and streaming decoding, optionally gzip framed.
//!
//! ## Quickstart
//!
//! ### Configuration
//!
//! The API key, endpoint and proxy are taken from [`ClientConfig`](client::ClientConfig)
//! when set, otherwise from `TD_API_KEY`, `TD_API_SERVER` and `HTTP_PROXY`.
//!
//! ```rust
//! use td_client::client::{Client, ClientConfig};
//!
//! async fn run() -> Result<(), td_client::http::error::Error> {
//!     let config = ClientConfig::default().with_apikey("1/0123456789abcdef");
//!     let client = Client::new(config)?;
//!     for (name, db) in client.list_databases().await? {
//!         println!("{name}: {} records", db.count);
//!     }
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ### Query
//!
//! ```rust
//! use std::time::Duration;
//! use td_client::client::{Client, ClientConfig};
//! use td_client::http::job::{IssueJobRequest, JobType};
//! use td_client::reader::Format;
//! use td_gax::poll::PollSetting;
//!
//! async fn run(client: &Client) -> Result<(), td_client::http::error::Error> {
//!     let request = IssueJobRequest::new(JobType::Presto, "SELECT COUNT(1) FROM www_access");
//!     let mut job = client.query("sample_datasets", &request).await?;
//!     job.wait(&PollSetting::default().with_timeout(Duration::from_secs(600))).await?;
//!
//!     let mut rows = job.result(Format::msgpack_gz()).await?;
//!     while let Some(row) = rows.next().await? {
//!         println!("{row:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Bulk import
//!
//! ```rust
//! use td_client::client::Client;
//! use td_client::codec::Record;
//! use td_gax::poll::PollSetting;
//!
//! async fn run(client: &Client) -> Result<(), td_client::http::error::Error> {
//!     let mut session = client.create_bulk_import("session_1", "db", "access").await?;
//!     let records = vec![Record::new().with("time", 1_700_000_000).with("path", "/index.html")];
//!     session.upload_records("part-1", &records).await?;
//!     session.freeze().await?;
//!     session.perform(Some(&PollSetting::default())).await?;
//!     session.commit(Some(&PollSetting::default())).await?;
//!     Ok(())
//! }
//! ```
pub mod bulk_import;
pub mod client;
pub mod codec;
pub mod http;
pub mod job;
pub mod parser;
pub mod reader;
pub mod source;
