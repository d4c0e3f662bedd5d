//! Control-plane wire messages: length-delimited protobuf frames, inbound
//! `NodeMessage` (connect or heartbeat) and outbound `ConfigUpdate`.

/// First frame a data plane must send after connecting.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub hostname: ::prost::alloc::string::String,
    /// Data-plane build version; gated against the control plane's.
    #[prost(string, tag = "3")]
    pub version: ::prost::alloc::string::String,
    /// Hash of the config the node currently runs, 0 when none.
    #[prost(uint64, tag = "4")]
    pub config_hash: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub config_version: u64,
    #[prost(uint64, tag = "3")]
    pub config_hash: u64,
    /// Free-form node health ("ok", "degraded", ...).
    #[prost(string, tag = "4")]
    pub node_status: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeMessage {
    #[prost(oneof = "node_message::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<node_message::Kind>,
}

pub mod node_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Connect(super::ConnectRequest),
        #[prost(message, tag = "2")]
        Heartbeat(super::HeartbeatRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigUpdate {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub yaml: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub hash: u64,
    /// Unix seconds when this envelope was stored.
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    /// "file" or "admin-api".
    #[prost(string, tag = "5")]
    pub source: ::prost::alloc::string::String,
}
