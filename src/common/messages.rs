//! Serialize and deserialize wire messages.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::id::DecodeIdError;
use crate::common::{Id, Node};

/// Version token attached to outgoing messages, "PD" version 02.
pub const VERSION: [u8; 4] = [80, 68, 0, 2];

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,

    /// The address the requester can be reached back at, as it advertises
    /// it. Responders record this address, not the UDP source.
    pub requester_address: SocketAddrV4,

    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    AnnounceUser(AnnounceUserRequestArguments),
    GetUser(GetUserRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    /// Also serves as the acknowledgement to AnnounceUser and as the
    /// "unknown user" reply to GetUser; callers interpret it by the request
    /// they sent.
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetUser(GetUserResponseArguments),
}

// === PING ===
#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === FIND_NODE ===
#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

// === Announce User ===
#[derive(Debug, PartialEq, Clone)]
pub struct AnnounceUserRequestArguments {
    pub username: String,
    /// The address the username should resolve to.
    pub address: SocketAddrV4,
}

// === Get User ===
#[derive(Debug, PartialEq, Clone)]
pub struct GetUserRequestArguments {
    pub username: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetUserResponseArguments {
    pub responder_id: Id,
    pub address: SocketAddrV4,
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    requester_address,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingRequestArguments {
                            id: requester_id.to_vec(),
                            from: sockaddr_to_bytes(&requester_address),
                        },
                    },
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: requester_id.to_vec(),
                                from: sockaddr_to_bytes(&requester_address),
                                target: find_node_args.target.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::AnnounceUser(announce_args) => {
                        internal::DHTRequestSpecific::AnnounceUser {
                            arguments: internal::DHTAnnounceUserRequestArguments {
                                id: requester_id.to_vec(),
                                from: sockaddr_to_bytes(&requester_address),
                                username: announce_args.username,
                                address: sockaddr_to_bytes(&announce_args.address),
                            },
                        }
                    }
                    RequestTypeSpecific::GetUser(get_user_args) => {
                        internal::DHTRequestSpecific::GetUser {
                            arguments: internal::DHTGetUserRequestArguments {
                                id: requester_id.to_vec(),
                                from: sockaddr_to_bytes(&requester_address),
                                username: get_user_args.username,
                            },
                        }
                    }
                }),

                MessageType::Response(res) => internal::DHTMessageVariant::Response(match res {
                    ResponseSpecific::Ping(ping_args) => internal::DHTResponseSpecific::Ping {
                        arguments: internal::DHTPingResponseArguments {
                            id: ping_args.responder_id.to_vec(),
                        },
                    },
                    ResponseSpecific::FindNode(find_node_args) => {
                        internal::DHTResponseSpecific::FindNode {
                            arguments: internal::DHTFindNodeResponseArguments {
                                id: find_node_args.responder_id.to_vec(),
                                nodes: nodes_to_bytes(&find_node_args.nodes),
                            },
                        }
                    }
                    ResponseSpecific::GetUser(get_user_args) => {
                        internal::DHTResponseSpecific::GetUser {
                            arguments: internal::DHTGetUserResponseArguments {
                                id: get_user_args.responder_id.to_vec(),
                                address: sockaddr_to_bytes(&get_user_args.address),
                            },
                        }
                    }
                }),

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, DecodeMessageError> {
        Ok(Message {
            transaction_id: transaction_id(&msg.transaction_id)?,
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            requester_address: bytes_to_sockaddr(arguments.from)?,
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            requester_address: bytes_to_sockaddr(arguments.from)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            }),
                        },
                        internal::DHTRequestSpecific::AnnounceUser { arguments } => {
                            RequestSpecific {
                                requester_id: Id::from_bytes(arguments.id)?,
                                requester_address: bytes_to_sockaddr(arguments.from)?,
                                request_type: RequestTypeSpecific::AnnounceUser(
                                    AnnounceUserRequestArguments {
                                        username: arguments.username,
                                        address: bytes_to_sockaddr(arguments.address)?,
                                    },
                                ),
                            }
                        }
                        internal::DHTRequestSpecific::GetUser { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            requester_address: bytes_to_sockaddr(arguments.from)?,
                            request_type: RequestTypeSpecific::GetUser(GetUserRequestArguments {
                                username: arguments.username,
                            }),
                        },
                    })
                }

                internal::DHTMessageVariant::Response(res_variant) => {
                    MessageType::Response(match res_variant {
                        internal::DHTResponseSpecific::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                            })
                        }
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                                nodes: bytes_to_nodes(arguments.nodes)?,
                            })
                        }
                        internal::DHTResponseSpecific::GetUser { arguments } => {
                            ResponseSpecific::GetUser(GetUserResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                                address: bytes_to_sockaddr(arguments.address)?,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_serde_message().to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeMessageError> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// Return the Id of the sender of the Message, if it carries one (every
    /// message but errors does).
    pub fn get_author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(arguments) => arguments.requester_id,
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::GetUser(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }

    /// If the response carries nodes closer to a target, return them.
    pub fn get_closer_nodes(&self) -> Option<Vec<Node>> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::FindNode(arguments)) => {
                Some(arguments.nodes.clone())
            }
            _ => None,
        }
    }

    /// The address a GetUser response resolved to, None for the bare
    /// "unknown user" acknowledgement.
    pub fn get_user_address(&self) -> Option<SocketAddrV4> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::GetUser(arguments)) => Some(arguments.address),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeMessageError {
    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    InvalidId(#[from] DecodeIdError),

    #[error("Invalid transaction id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    #[error("Wrong number of bytes for sockaddr")]
    InvalidSockAddr,

    #[error("Nodes bytes should be a multiple of 26")]
    InvalidNodes,
}

/// Return the transaction Id as a u16
pub fn transaction_id(bytes: &[u8]) -> Result<u16, DecodeMessageError> {
    if bytes.len() == 2 {
        return Ok(((bytes[0] as u16) << 8) | (bytes[1] as u16));
    } else if bytes.len() == 1 {
        return Ok(bytes[0] as u16);
    }

    Err(DecodeMessageError::InvalidTransactionId(bytes.to_vec()))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4, DecodeMessageError> {
    let bytes = bytes.as_ref();

    if bytes.len() != 6 {
        return Err(DecodeMessageError::InvalidSockAddr);
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(SocketAddrV4::new(ip, port))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(6);
    bytes.extend_from_slice(&sockaddr.ip().octets());
    bytes.extend_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

/// Compact node info, 26 bytes per node: 20 bytes of id, 4 of ip, 2 of port.
fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * 26);

    for node in nodes {
        bytes.extend_from_slice(node.id.as_bytes());
        bytes.extend_from_slice(&sockaddr_to_bytes(&node.address));
    }

    bytes
}

fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>, DecodeMessageError> {
    let bytes = bytes.as_ref();

    if bytes.len() % 26 != 0 {
        return Err(DecodeMessageError::InvalidNodes);
    }

    let mut nodes = Vec::with_capacity(bytes.len() / 26);
    for chunk in bytes.chunks_exact(26) {
        let id = Id::from_bytes(&chunk[..20])?;
        let address = bytes_to_sockaddr(&chunk[20..])?;

        nodes.push(Node::new(id, address));
    }

    Ok(nodes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn requester() -> (Id, SocketAddrV4) {
        (
            Id([0_u8; 20]),
            SocketAddrV4::new([127, 0, 0, 1].into(), 6991),
        )
    }

    #[test]
    fn ping_request() {
        let (requester_id, requester_address) = requester();

        let original_msg = Message {
            transaction_id: 258,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Request(RequestSpecific {
                requester_id,
                requester_address,
                request_type: RequestTypeSpecific::Ping,
            }),
        };

        // The same message written out by hand, with the dictionary keys in
        // sorted order.
        let wire = b"d1:ad4:from6:\x7f\x00\x00\x01\x1b\x4f2:id20:\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00e1:q4:ping1:t2:\x01\x021:v4:PD\x00\x021:y1:qe";

        assert_eq!(Message::from_bytes(wire).unwrap(), original_msg);

        let serded_msg = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(serded_msg).unwrap();

        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn find_node_request() {
        let (requester_id, requester_address) = requester();

        let original_msg = Message {
            transaction_id: 3,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id,
                requester_address,
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::random(),
                }),
            }),
        };

        let serded_msg = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(serded_msg).unwrap();

        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn find_node_response() {
        let original_msg = Message {
            transaction_id: 17,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![
                        Node::new(Id::random(), SocketAddrV4::new([10, 0, 0, 7].into(), 1234)),
                        Node::new(Id::random(), SocketAddrV4::new([10, 0, 0, 8].into(), 4321)),
                    ],
                },
            )),
        };

        let serded_msg = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(serded_msg).unwrap();

        assert_eq!(parsed_msg, original_msg);
        assert_eq!(
            parsed_msg.get_closer_nodes().map(|nodes| nodes.len()),
            Some(2)
        );
    }

    #[test]
    fn announce_user_request() {
        let (requester_id, requester_address) = requester();

        let original_msg = Message {
            transaction_id: 90,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Request(RequestSpecific {
                requester_id,
                requester_address,
                request_type: RequestTypeSpecific::AnnounceUser(AnnounceUserRequestArguments {
                    username: "alice".to_string(),
                    address: SocketAddrV4::new([192, 168, 1, 7].into(), 53141),
                }),
            }),
        };

        let serded_msg = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(serded_msg).unwrap();

        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn get_user_responses() {
        let resolved = Message {
            transaction_id: 91,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::GetUser(
                GetUserResponseArguments {
                    responder_id: Id::random(),
                    address: SocketAddrV4::new([192, 168, 1, 7].into(), 53141),
                },
            )),
        };

        let parsed = Message::from_bytes(resolved.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, resolved);
        assert_eq!(
            parsed.get_user_address(),
            Some(SocketAddrV4::new([192, 168, 1, 7].into(), 53141))
        );

        // An unknown user comes back as a bare acknowledgement.
        let unknown = Message {
            transaction_id: 91,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        };

        let parsed = Message::from_bytes(unknown.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, unknown);
        assert_eq!(parsed.get_user_address(), None);
    }

    #[test]
    fn error_message() {
        let original_msg = Message {
            transaction_id: 7,
            version: None,
            message_type: MessageType::Error(ErrorSpecific {
                code: 201,
                description: "Generic Error".to_string(),
            }),
        };

        let serded_msg = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(serded_msg).unwrap();

        assert_eq!(parsed_msg, original_msg);
        assert_eq!(parsed_msg.get_author_id(), None);
    }

    #[test]
    fn parse_transaction_id() {
        assert_eq!(transaction_id(&[1, 2]).unwrap(), 258);
        assert_eq!(transaction_id(&[7]).unwrap(), 7);
        assert!(transaction_id(&[1, 2, 3]).is_err());
        assert!(transaction_id(&[]).is_err());
    }

    #[test]
    fn rejects_malformed_packets() {
        assert!(Message::from_bytes(b"garbage").is_err());
        assert!(Message::from_bytes(b"d1:t2:aae").is_err());

        assert!(bytes_to_sockaddr([1, 2, 3]).is_err());
        assert!(bytes_to_nodes([0_u8; 27]).is_err());
    }
}
