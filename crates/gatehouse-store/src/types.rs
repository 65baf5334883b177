//! Shared store types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One message handed to a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
}

/// Instance record announced to the registry on start and withdrawn first on
/// stop, so the routing tier stops sending traffic before anything shuts
/// down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub version: String,
    pub host: String,
    pub pub_addr: String,
    pub sub_addr: String,
}
