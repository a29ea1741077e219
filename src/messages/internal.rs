use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<Vec<u8>>,

    #[serde(flatten)]
    pub variant: DhtMessageVariant,

    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub ip: Option<Vec<u8>>,

    #[serde(default)]
    #[serde(rename = "ro")]
    pub read_only: Option<i32>,
}

impl DhtMessage {
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<DhtMessage> {
        let bytes = bytes.as_ref();
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(Error::BencodeError)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DhtMessageVariant {
    #[serde(rename = "q")]
    Request(DhtRequestSpecific),

    #[serde(rename = "r")]
    Response(DhtResponse),

    #[serde(rename = "e")]
    Error(DhtErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DhtRequestSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: DhtPingArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: DhtFindNodeArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtResponse {
    #[serde(rename = "r")]
    pub arguments: DhtResponseArguments,
}

/// One schema for all response bodies; which public variant it becomes is
/// decided by the pending-call resolver, not by the wire shape alone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes: Option<Vec<u8>>,

    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes6: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: Vec<serde_bencode::value::Value>,
}

// === PING ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtPingArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

// === FIND_NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtFindNodeArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
}
