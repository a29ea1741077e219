//! KRPC message layer: typed messages over the bencoded wire dictionaries.

mod internal;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{decode_compact_v4, decode_compact_v6, Id, Node};
use crate::{Error, Result};

/// KRPC error codes (BEP 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GenericError,
    ServerError,
    ProtocolError,
    MethodUnknown,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::GenericError => 201,
            ErrorCode::ServerError => 202,
            ErrorCode::ProtocolError => 203,
            ErrorCode::MethodUnknown => 204,
        }
    }
}

/// Which request schema a response body should be parsed against. Resolved by
/// peeking the pending-call table for the response's transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Ping,
    FindNode,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    /// The IP address and port ("SocketAddr") of the requester as seen from
    /// the responder's point of view (BEP 42). Set only on responses.
    pub requester_ip: Option<SocketAddr>,

    /// BEP 43. When set true on a request, the requester can't answer requests
    /// and should not be added to routing tables.
    pub read_only: Option<bool>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl Message {
    /// The method a pending call of this request would resolve responses with.
    pub fn request_method(&self) -> Option<RequestMethod> {
        match &self.message_type {
            MessageType::Request(req) => Some(match req.request_type {
                RequestTypeSpecific::Ping => RequestMethod::Ping,
                RequestTypeSpecific::FindNode(_) => RequestMethod::FindNode,
            }),
            _ => None,
        }
    }

    /// Return the Id of the sender of the Message, if the message carries one
    /// (error messages don't).
    pub fn get_author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(request) => request.requester_id,
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.clone().into_serde_message().to_bytes()
    }

    /// Parses a message, typing response bodies with `resolver`, which peeks
    /// the pending-call table (`transaction id -> request method`). Without a
    /// matching call the body shape decides (`nodes`/`nodes6` present means
    /// find-node).
    pub fn from_bytes<T, R>(bytes: T, resolver: R) -> Result<Message>
    where
        T: AsRef<[u8]>,
        R: FnOnce(&[u8]) -> Option<RequestMethod>,
    {
        Message::from_serde_message(internal::DhtMessage::from_bytes(bytes)?, resolver)
    }

    fn into_serde_message(self) -> internal::DhtMessage {
        internal::DhtMessage {
            transaction_id: self.transaction_id,
            version: self.version,
            ip: self
                .requester_ip
                .map(|sockaddr| sockaddr_to_bytes(&sockaddr)),
            read_only: self
                .read_only
                .map(|read_only| if read_only { 1 } else { 0 }),
            variant: match self.message_type {
                MessageType::Request(req) => {
                    let id = req.requester_id.to_vec();
                    internal::DhtMessageVariant::Request(match req.request_type {
                        RequestTypeSpecific::Ping => internal::DhtRequestSpecific::Ping {
                            arguments: internal::DhtPingArguments { id },
                        },
                        RequestTypeSpecific::FindNode(args) => {
                            internal::DhtRequestSpecific::FindNode {
                                arguments: internal::DhtFindNodeArguments {
                                    id,
                                    target: args.target.to_vec(),
                                },
                            }
                        }
                    })
                }

                MessageType::Response(res) => {
                    internal::DhtMessageVariant::Response(internal::DhtResponse {
                        arguments: match res {
                            ResponseSpecific::Ping(args) => internal::DhtResponseArguments {
                                id: args.responder_id.to_vec(),
                                nodes: None,
                                nodes6: None,
                            },
                            ResponseSpecific::FindNode(args) => {
                                let (nodes, nodes6) = encode_nodes(&args.nodes);
                                internal::DhtResponseArguments {
                                    id: args.responder_id.to_vec(),
                                    nodes,
                                    nodes6,
                                }
                            }
                        },
                    })
                }

                MessageType::Error(err) => {
                    internal::DhtMessageVariant::Error(internal::DhtErrorSpecific {
                        error_info: vec![
                            serde_bencode::value::Value::Int(err.code.into()),
                            serde_bencode::value::Value::Bytes(err.description.into()),
                        ],
                    })
                }
            },
        }
    }

    fn from_serde_message<R>(msg: internal::DhtMessage, resolver: R) -> Result<Message>
    where
        R: FnOnce(&[u8]) -> Option<RequestMethod>,
    {
        Ok(Message {
            requester_ip: match msg.ip {
                Some(ip) => Some(bytes_to_sockaddr(&ip)?),
                _ => None,
            },
            read_only: msg.read_only.map(|read_only| read_only >= 1),

            message_type: match msg.variant {
                internal::DhtMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DhtRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(&arguments.id)?,
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DhtRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(&arguments.id)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(&arguments.target)?,
                            }),
                        },
                    })
                }

                internal::DhtMessageVariant::Response(res) => {
                    let arguments = res.arguments;
                    let responder_id = Id::from_bytes(&arguments.id)?;

                    let method = resolver(&msg.transaction_id).unwrap_or_else(|| {
                        if arguments.nodes.is_some() || arguments.nodes6.is_some() {
                            RequestMethod::FindNode
                        } else {
                            RequestMethod::Ping
                        }
                    });

                    MessageType::Response(match method {
                        RequestMethod::Ping => ResponseSpecific::Ping(PingResponseArguments {
                            responder_id,
                        }),
                        RequestMethod::FindNode => {
                            let mut nodes = arguments
                                .nodes
                                .as_deref()
                                .map(decode_compact_v4)
                                .unwrap_or_default();
                            nodes.extend(
                                arguments
                                    .nodes6
                                    .as_deref()
                                    .map(decode_compact_v6)
                                    .unwrap_or_default(),
                            );
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id,
                                nodes,
                            })
                        }
                    })
                }

                internal::DhtMessageVariant::Error(err) => {
                    if err.error_info.len() < 2 {
                        return Err(Error::BencodeError(serde_bencode::Error::Custom(
                            "Error packet should have at least 2 elements".into(),
                        )));
                    }
                    MessageType::Error(ErrorSpecific {
                        code: match err.error_info[0] {
                            serde_bencode::value::Value::Int(code) => {
                                code.try_into().map_err(|_| {
                                    Error::BencodeError(serde_bencode::Error::Custom(
                                        "error code out of range".into(),
                                    ))
                                })?
                            }
                            _ => {
                                return Err(Error::BencodeError(serde_bencode::Error::Custom(
                                    "Expected error code as first element".into(),
                                )))
                            }
                        },
                        description: match &err.error_info[1] {
                            serde_bencode::value::Value::Bytes(desc) => {
                                String::from_utf8_lossy(desc).to_string()
                            }
                            _ => {
                                return Err(Error::BencodeError(serde_bencode::Error::Custom(
                                    "Expected description as second element".into(),
                                )))
                            }
                        },
                    })
                }
            },

            transaction_id: msg.transaction_id,
            version: msg.version,
        })
    }
}

fn encode_nodes(nodes: &[Node]) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for node in nodes {
        match node.address.ip() {
            IpAddr::V4(_) => node.encode_compact(&mut v4),
            IpAddr::V6(_) => node.encode_compact(&mut v6),
        }
    }

    (
        (!v4.is_empty()).then_some(v4),
        (!v6.is_empty()).then_some(v6),
    )
}

fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = match sockaddr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&sockaddr.port().to_be_bytes());
    bytes
}

fn bytes_to_sockaddr(bytes: &[u8]) -> Result<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip: [u8; 4] = bytes[..4].try_into().expect("infallible");
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        18 => {
            let ip: [u8; 16] = bytes[..16].try_into().expect("infallible");
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => Err(Error::BencodeError(serde_bencode::Error::Custom(
            "wrong number of bytes for sockaddr".into(),
        ))),
    }
}
