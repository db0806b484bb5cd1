//! Network traffic samples, HTTP connections and their lazily fetched details.

use serde::{Deserialize, Serialize};

use crate::storage::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub timestamp_ns: i64,
    pub sent_bytes_per_sec: i64,
    pub received_bytes_per_sec: i64,
}

impl Entity for TrafficSample {
    const KIND: EntityKind = EntityKind::NetworkTraffic;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCountSample {
    pub timestamp_ns: i64,
    pub open_connections: i32,
}

impl Entity for ConnectionCountSample {
    const KIND: EntityKind = EntityKind::ConnectionCount;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkData {
    #[serde(default)]
    pub traffic: Vec<TrafficSample>,
    #[serde(default)]
    pub connections: Vec<ConnectionCountSample>,
}

/// An HTTP exchange. `end_timestamp_ns == 0` while the connection is still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConnection {
    pub connection_id: i64,
    pub start_timestamp_ns: i64,
    #[serde(default)]
    pub end_timestamp_ns: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
}

impl HttpConnection {
    pub fn is_complete(&self) -> bool {
        self.end_timestamp_ns != 0
    }
}

impl Entity for HttpConnection {
    const KIND: EntityKind = EntityKind::HttpConnection;

    fn id(&self) -> String {
        self.connection_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    Request,
    Response,
    Threads,
}

impl DetailKind {
    pub const ALL: [DetailKind; 3] = [DetailKind::Request, DetailKind::Response, DetailKind::Threads];

    pub fn as_str(self) -> &'static str {
        match self {
            DetailKind::Request => "request",
            DetailKind::Response => "response",
            DetailKind::Threads => "threads",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpDetail {
    pub connection_id: i64,
    pub kind: DetailKind,
    #[serde(default)]
    pub content: serde_json::Value,
    /// Start of the owning connection, used for range queries.
    #[serde(default)]
    pub timestamp_ns: i64,
}

impl Entity for HttpDetail {
    const KIND: EntityKind = EntityKind::HttpDetail;

    fn id(&self) -> String {
        format!("{}:{}", self.connection_id, self.kind.as_str())
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}
