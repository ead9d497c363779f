//! KRPC-style message construction and parsing: the query/response/error
//! envelope every DHT datagram carries, plus the compact peer encodings.

use crate::bencode::{self, Value};
use crate::identity::Id;
use crate::routing::Peer;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// A correlation tag. The protocol allows any length; this crate's own
/// queries always use 2 octets, but inbound messages of other lengths are
/// still accepted by the parser.
pub type Tag = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
}

impl Method {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            Method::Ping => b"ping",
            Method::FindNode => b"find_node",
            Method::GetPeers => b"get_peers",
        }
    }

    fn parse(bytes: &[u8]) -> Option<Method> {
        match bytes {
            b"ping" => Some(Method::Ping),
            b"find_node" => Some(Method::FindNode),
            b"get_peers" => Some(Method::GetPeers),
            _ => None,
        }
    }
}

/// A parsed, classified DHT message. Dynamic dispatch on message kind is a
/// tagged variant, not a class hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query { t: Tag, q: Method, a: BTreeMap<Vec<u8>, Value> },
    Response { t: Tag, r: BTreeMap<Vec<u8>, Value> },
    Error { t: Tag, code: i64, reason: Vec<u8> },
}

impl Message {
    pub fn tag(&self) -> &Tag {
        match self {
            Message::Query { t, .. } => t,
            Message::Response { t, .. } => t,
            Message::Error { t, .. } => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed dht message: {}", self.reason)
    }
}

impl std::error::Error for ParseError {}

fn parse_err(reason: impl Into<String>) -> ParseError {
    ParseError { reason: reason.into() }
}

fn id_value(id: &Id) -> Value {
    Value::bytes(id.as_bytes().to_vec())
}

fn dict_of(pairs: Vec<(&'static [u8], Value)>) -> BTreeMap<Vec<u8>, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_vec(), v)).collect()
}

/// Builds the outer envelope and encodes it to bencode bytes.
fn build(t: &Tag, y: &[u8], extra: Vec<(&'static [u8], Value)>) -> Vec<u8> {
    let mut map = dict_of(vec![
        (b"t", Value::bytes(t.clone())),
        (b"y", Value::bytes(y.to_vec())),
    ]);
    for (k, v) in extra {
        map.insert(k.to_vec(), v);
    }
    bencode::encode(&Value::Dict(map)).expect("constructed values are always encodable")
}

/// `a = {id: sender_id}`.
pub fn create_ping(t: &Tag, sender_id: &Id) -> Vec<u8> {
    let a = Value::Dict(dict_of(vec![(b"id", id_value(sender_id))]));
    build(t, b"q", vec![(b"q", Value::bytes(Method::Ping.as_bytes().to_vec())), (b"a", a)])
}

/// `a = {id: sender_id, target: target_id}`.
pub fn create_find_node(t: &Tag, sender_id: &Id, target: &Id) -> Vec<u8> {
    let a = Value::Dict(dict_of(vec![
        (b"id", id_value(sender_id)),
        (b"target", id_value(target)),
    ]));
    build(t, b"q", vec![(b"q", Value::bytes(Method::FindNode.as_bytes().to_vec())), (b"a", a)])
}

/// `a = {id: sender_id, info_hash: content_id}`.
pub fn create_get_peers(t: &Tag, sender_id: &Id, info_hash: &Id) -> Vec<u8> {
    let a = Value::Dict(dict_of(vec![
        (b"id", id_value(sender_id)),
        (b"info_hash", id_value(info_hash)),
    ]));
    build(t, b"q", vec![(b"q", Value::bytes(Method::GetPeers.as_bytes().to_vec())), (b"a", a)])
}

/// `r = {id: local_id}`.
pub fn create_ping_response(t: &Tag, local_id: &Id) -> Vec<u8> {
    let r = Value::Dict(dict_of(vec![(b"id", id_value(local_id))]));
    build(t, b"r", vec![(b"r", r)])
}

/// `r = {id: local_id, nodes: pack(closest)}`.
pub fn create_find_node_response(t: &Tag, local_id: &Id, nodes: &[Peer]) -> Vec<u8> {
    let r = Value::Dict(dict_of(vec![
        (b"id", id_value(local_id)),
        (b"nodes", Value::bytes(pack_nodes(nodes))),
    ]));
    build(t, b"r", vec![(b"r", r)])
}

/// `r = {id: local_id, token, nodes: pack(closest)}`. `token` is a fixed
/// placeholder: this crate never validates or honors announces.
pub fn create_get_peers_response(t: &Tag, local_id: &Id, token: &[u8], nodes: &[Peer]) -> Vec<u8> {
    let r = Value::Dict(dict_of(vec![
        (b"id", id_value(local_id)),
        (b"token", Value::bytes(token.to_vec())),
        (b"nodes", Value::bytes(pack_nodes(nodes))),
    ]));
    build(t, b"r", vec![(b"r", r)])
}

/// Decodes and classifies a raw datagram. Malformed messages are reported
/// here but callers treat the transport as adversarial and drop them silently.
pub fn parse(data: &[u8]) -> Result<Message, ParseError> {
    let (value, _) = bencode::decode(data).map_err(|e| parse_err(e.to_string()))?;
    let dict = value.as_dict().ok_or_else(|| parse_err("message is not a dict"))?;

    let t = dict
        .get(b"t".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| parse_err("missing required field 't'"))?
        .to_vec();

    let y = dict
        .get(b"y".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| parse_err("missing required field 'y'"))?;

    match y {
        b"q" => {
            let q = dict
                .get(b"q".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| parse_err("query missing 'q' method name"))?;
            let method = Method::parse(q).ok_or_else(|| parse_err("unknown query method"))?;
            let a = dict
                .get(b"a".as_slice())
                .and_then(|v| v.as_dict())
                .ok_or_else(|| parse_err("query missing 'a' argument map"))?
                .clone();
            Ok(Message::Query { t, q: method, a })
        }
        b"r" => {
            let r = dict
                .get(b"r".as_slice())
                .and_then(|v| v.as_dict())
                .ok_or_else(|| parse_err("response missing 'r' result map"))?
                .clone();
            Ok(Message::Response { t, r })
        }
        b"e" => {
            let e = dict
                .get(b"e".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| parse_err("error missing 'e' list"))?;
            let code = e.first().and_then(|v| v.as_int()).unwrap_or(0);
            let reason = e
                .get(1)
                .and_then(|v| v.as_bytes())
                .map(|b| b.to_vec())
                .unwrap_or_default();
            Ok(Message::Error { t, code, reason })
        }
        _ => Err(parse_err("'y' must be one of q, r, e")),
    }
}

/// Extracts the 20-byte `id` argument/result field common to every message.
pub fn extract_id(map: &BTreeMap<Vec<u8>, Value>) -> Option<Id> {
    map.get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| Id::try_from(b).ok())
}

/// Compact node encoding: 26 octets per entry (20-byte id, 4-byte IPv4,
/// 2-byte big-endian port).
pub fn pack_nodes(nodes: &[Peer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.extend_from_slice(&node.addr.octets());
        out.extend_from_slice(&node.port.to_be_bytes());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactError {
    pub len: usize,
}

impl fmt::Display for CompactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compact node data length {} is not a multiple of 26", self.len)
    }
}

impl std::error::Error for CompactError {}

/// Unpacks the compact node encoding. Rejects any input whose length is not
/// a multiple of 26.
pub fn unpack_nodes(data: &[u8]) -> Result<Vec<Peer>, CompactError> {
    if data.len() % 26 != 0 {
        return Err(CompactError { len: data.len() });
    }
    let mut out = Vec::with_capacity(data.len() / 26);
    for chunk in data.chunks_exact(26) {
        let id = Id::try_from(&chunk[0..20]).expect("chunk is exactly 20 bytes");
        let addr = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        out.push(Peer { id, addr, port });
    }
    Ok(out)
}

/// Compact peer encoding used by `get_peers` responses' `values` list: 6
/// octets (4-byte IPv4, 2-byte big-endian port), no id.
pub fn pack_values(peers: &[std::net::SocketAddrV4]) -> Vec<Vec<u8>> {
    peers
        .iter()
        .map(|addr| {
            let mut out = Vec::with_capacity(6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
            out
        })
        .collect()
}

pub fn unpack_value(data: &[u8]) -> Option<std::net::SocketAddrV4> {
    if data.len() != 6 {
        return None;
    }
    let addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(std::net::SocketAddrV4::new(addr, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Id {
        Id::new([byte; 20])
    }

    #[test]
    fn ping_parses_back_to_expected_shape() {
        // spec.md section 8 scenario 3.
        let t = b"aa".to_vec();
        let bytes = create_ping(&t, &id(b'A'));
        let parsed = parse(&bytes).unwrap();
        match parsed {
            Message::Query { t: got_t, q, a } => {
                assert_eq!(got_t, t);
                assert_eq!(q, Method::Ping);
                assert_eq!(extract_id(&a).unwrap(), id(b'A'));
            }
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn find_node_parses_back_to_expected_shape() {
        let t = b"bb".to_vec();
        let bytes = create_find_node(&t, &id(1), &id(2));
        match parse(&bytes).unwrap() {
            Message::Query { q, a, .. } => {
                assert_eq!(q, Method::FindNode);
                assert_eq!(extract_id(&a).unwrap(), id(1));
                let target = a.get(b"target".as_slice()).unwrap().as_bytes().unwrap();
                assert_eq!(Id::try_from(target).unwrap(), id(2));
            }
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn get_peers_parses_back_to_expected_shape() {
        let t = b"cc".to_vec();
        let bytes = create_get_peers(&t, &id(3), &id(4));
        match parse(&bytes).unwrap() {
            Message::Query { q, a, .. } => {
                assert_eq!(q, Method::GetPeers);
                let info_hash = a.get(b"info_hash".as_slice()).unwrap().as_bytes().unwrap();
                assert_eq!(Id::try_from(info_hash).unwrap(), id(4));
            }
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn compact_node_roundtrip() {
        // spec.md section 8 scenario 4.
        let peer = Peer::new(id(b'A'), Ipv4Addr::new(192, 168, 1, 1), 6881).unwrap();
        let packed = pack_nodes(&[peer]);
        assert_eq!(packed.len(), 26);
        let unpacked = unpack_nodes(&packed).unwrap();
        assert_eq!(unpacked, vec![peer]);
    }

    #[test]
    fn unpack_nodes_rejects_non_multiple_of_26() {
        assert!(unpack_nodes(&[0u8; 25]).is_err());
    }

    #[test]
    fn unpack_value_rejects_wrong_length() {
        assert!(unpack_value(&[0u8; 5]).is_none());
    }

    #[test]
    fn value_roundtrip() {
        let addr = std::net::SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        let packed = pack_values(&[addr]);
        assert_eq!(packed[0].len(), 6);
        assert_eq!(unpack_value(&packed[0]).unwrap(), addr);
    }

    #[test]
    fn parse_rejects_missing_y() {
        let bytes = bencode::encode(&Value::Dict(dict_of(vec![(b"t", Value::bytes(b"aa".to_vec()))])))
            .unwrap();
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn parse_rejects_missing_t() {
        let bytes = bencode::encode(&Value::Dict(dict_of(vec![(b"y", Value::bytes(b"q".to_vec()))])))
            .unwrap();
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn parse_accepts_non_2_byte_tag() {
        // The local convention is 2 octets, but parsing inbound messages
        // must accept other lengths.
        let t = b"abcdef".to_vec();
        let bytes = create_ping(&t, &id(1));
        let mut replaced = bencode::decode(&bytes).unwrap().0;
        if let Value::Dict(ref mut d) = replaced {
            d.insert(b"t".to_vec(), Value::bytes(b"x".to_vec()));
        }
        let bytes = bencode::encode(&replaced).unwrap();
        match parse(&bytes).unwrap() {
            Message::Query { t, .. } => assert_eq!(t, b"x".to_vec()),
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn parse_decodes_error_message() {
        let err = Value::List(vec![Value::Int(201), Value::bytes(b"generic error".to_vec())]);
        let map = dict_of(vec![
            (b"t", Value::bytes(b"aa".to_vec())),
            (b"y", Value::bytes(b"e".to_vec())),
            (b"e", err),
        ]);
        let bytes = bencode::encode(&Value::Dict(map)).unwrap();
        match parse(&bytes).unwrap() {
            Message::Error { code, reason, .. } => {
                assert_eq!(code, 201);
                assert_eq!(reason, b"generic error".to_vec());
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
