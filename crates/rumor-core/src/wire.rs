//! Binary wire encoding for gossip messages.
//!
//! Every message starts with a three byte preamble:
//!
//! ```text
//! +--------+---------+------+
//! | marker | version | kind |
//! +--------+---------+------+
//! ```
//!
//! followed by the cluster name and the kind-specific fields. Multi-byte
//! integers are big-endian. Strings are a `u16` length followed by UTF-8.
//!
//! A snapshot is encoded as:
//!
//! ```text
//! kind:u8 | id:u64 u64 | family:u8 [ip:4|16 port:u16] | tcp_port:u16
//!         | sequence:i16 | timestamp:u24 | hops:u8 | [attributes]
//! ```
//!
//! where `family` is 0 (no address), 4 or 6, and the attribute map is only
//! present for payload updates: a `u16` count of (string key, `u16`
//! length-prefixed value) pairs.

use crate::error::{GossipError, Result};
use crate::gossip::{GossipMessage, MessageBody, MessageKind};
use crate::protocol::{MemberId, Sequence, Timestamp};
use crate::snapshot::{Attributes, Snapshot, SnapshotKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// First byte of every gossip message.
pub const PROTOCOL_MARKER: u8 = 0xA7;

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

const FAMILY_NONE: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encodes a message into a fresh buffer.
///
/// # Errors
///
/// Returns [`GossipError::Codec`] if a string, list or value is too long for
/// its length prefix.
pub fn encode_message(message: &GossipMessage) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(PROTOCOL_MARKER);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(message.kind().as_u8());
    put_string(&mut buf, &message.cluster)?;

    match &message.body {
        MessageBody::FirstContactRequest { sender }
        | MessageBody::PingRequest { sender }
        | MessageBody::PingResponse { sender }
        | MessageBody::Disconnection { sender } => put_snapshot(&mut buf, sender)?,
        MessageBody::FirstContactResponse {
            sender,
            requester,
            observed,
        } => {
            put_snapshot(&mut buf, sender)?;
            put_member_id(&mut buf, *requester);
            put_address(&mut buf, Some(*observed));
        }
        MessageBody::Forwardable { sender, relayed } => {
            put_snapshot(&mut buf, sender)?;
            put_snapshots(&mut buf, relayed)?;
        }
        MessageBody::ResyncRequest { sender, headers } => {
            put_snapshot(&mut buf, sender)?;
            put_snapshots(&mut buf, headers)?;
        }
        MessageBody::ResyncResponse { updates, wanted } => {
            put_snapshots(&mut buf, updates)?;
            put_len(&mut buf, wanted.len(), "wanted list")?;
            for id in wanted {
                put_member_id(&mut buf, *id);
            }
        }
    }

    Ok(buf.freeze())
}

/// Decodes a message.
///
/// # Errors
///
/// Returns [`GossipError::Codec`] for a bad marker, truncated input or
/// trailing garbage, [`GossipError::UnsupportedVersion`] and
/// [`GossipError::UnknownMessageKind`] for preambles this build cannot handle.
pub fn decode_message(mut input: &[u8]) -> Result<GossipMessage> {
    let buf = &mut input;
    ensure(buf, 3, "preamble")?;
    let marker = buf.get_u8();
    if marker != PROTOCOL_MARKER {
        return Err(GossipError::Codec(format!("bad protocol marker {marker:#04x}")));
    }
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(GossipError::UnsupportedVersion(version));
    }
    let ordinal = buf.get_u8();
    let kind = MessageKind::from_u8(ordinal).ok_or(GossipError::UnknownMessageKind(ordinal))?;
    let cluster = get_string(buf)?;

    let body = match kind {
        MessageKind::FirstContactRequest => MessageBody::FirstContactRequest {
            sender: get_snapshot(buf)?,
        },
        MessageKind::FirstContactResponse => {
            let sender = get_snapshot(buf)?;
            let requester = get_member_id(buf)?;
            let observed = get_address(buf)?
                .ok_or_else(|| GossipError::Codec("missing observed address".to_string()))?;
            MessageBody::FirstContactResponse {
                sender,
                requester,
                observed,
            }
        }
        MessageKind::Forwardable => MessageBody::Forwardable {
            sender: get_snapshot(buf)?,
            relayed: get_snapshots(buf)?,
        },
        MessageKind::PingRequest => MessageBody::PingRequest {
            sender: get_snapshot(buf)?,
        },
        MessageKind::PingResponse => MessageBody::PingResponse {
            sender: get_snapshot(buf)?,
        },
        MessageKind::Disconnection => MessageBody::Disconnection {
            sender: get_snapshot(buf)?,
        },
        MessageKind::ResyncRequest => MessageBody::ResyncRequest {
            sender: get_snapshot(buf)?,
            headers: get_snapshots(buf)?,
        },
        MessageKind::ResyncResponse => {
            let updates = get_snapshots(buf)?;
            ensure(buf, 2, "wanted count")?;
            let count = buf.get_u16() as usize;
            let mut wanted = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                wanted.push(get_member_id(buf)?);
            }
            MessageBody::ResyncResponse { updates, wanted }
        }
    };

    if buf.has_remaining() {
        return Err(GossipError::Codec(format!(
            "{} trailing bytes after {kind:?}",
            buf.remaining()
        )));
    }

    Ok(GossipMessage { cluster, body })
}

/// Appends one snapshot.
///
/// # Errors
///
/// Returns [`GossipError::Codec`] if the attribute map does not fit its
/// length prefixes.
pub fn put_snapshot(buf: &mut BytesMut, snapshot: &Snapshot) -> Result<()> {
    buf.put_u8(snapshot.kind().as_u8());
    put_member_id(buf, snapshot.member());
    put_address(buf, snapshot.udp_address());
    buf.put_u16(snapshot.tcp_port());
    buf.put_i16(snapshot.sequence().raw());
    put_u24(buf, snapshot.timestamp().raw());
    buf.put_u8(snapshot.hops());
    if snapshot.kind().has_payload() {
        put_attributes(buf, snapshot.attributes())?;
    }
    Ok(())
}

/// Reads one snapshot.
///
/// # Errors
///
/// Returns [`GossipError::Codec`] on truncated or malformed input.
pub fn get_snapshot(buf: &mut &[u8]) -> Result<Snapshot> {
    ensure(buf, 1, "snapshot kind")?;
    let ordinal = buf.get_u8();
    let kind = SnapshotKind::from_u8(ordinal)
        .ok_or_else(|| GossipError::Codec(format!("unknown snapshot kind {ordinal}")))?;
    let member = get_member_id(buf)?;
    let address = get_address(buf)?;
    ensure(buf, 2 + 2 + 3 + 1, "snapshot version")?;
    let tcp_port = buf.get_u16();
    let sequence = Sequence::new(buf.get_i16());
    let timestamp = Timestamp::from_raw(get_u24(buf));
    let hops = buf.get_u8();

    let mut snapshot = Snapshot::new(member, kind)
        .with_optional_address(address)
        .with_tcp_port(tcp_port)
        .with_sequence(sequence)
        .with_timestamp(timestamp)
        .with_hops(hops);
    if kind.has_payload() {
        snapshot = snapshot.with_attributes(get_attributes(buf)?);
    }
    Ok(snapshot)
}

/// Number of bytes [`put_snapshot`] will write for `snapshot`.
#[must_use]
pub fn snapshot_len(snapshot: &Snapshot) -> usize {
    let address = match snapshot.udp_address() {
        None => 1,
        Some(SocketAddr::V4(_)) => 1 + 4 + 2,
        Some(SocketAddr::V6(_)) => 1 + 16 + 2,
    };
    let attributes = if snapshot.kind().has_payload() {
        2 + snapshot
            .attributes()
            .iter()
            .map(|(k, v)| 2 + k.len() + 2 + v.len())
            .sum::<usize>()
    } else {
        0
    };
    1 + 16 + address + 2 + 2 + 3 + 1 + attributes
}

/// Bytes a FORWARDABLE message for `cluster` takes before its first relayed
/// snapshot: preamble, cluster name, sender snapshot and the relay count.
#[must_use]
pub fn forwardable_overhead(cluster: &str, sender: &Snapshot) -> usize {
    3 + 2 + cluster.len() + snapshot_len(sender) + 2
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(GossipError::Codec(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize, what: &str) -> Result<()> {
    let len = u16::try_from(len)
        .map_err(|_| GossipError::Codec(format!("{what} too long: {len}")))?;
    buf.put_u16(len);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_len(buf, value.len(), "string")?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    ensure(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    ensure(buf, len, "string")?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| GossipError::Codec(format!("invalid UTF-8: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(value)
}

fn put_member_id(buf: &mut BytesMut, id: MemberId) {
    let (high, low) = id.halves();
    buf.put_u64(high);
    buf.put_u64(low);
}

fn get_member_id(buf: &mut &[u8]) -> Result<MemberId> {
    ensure(buf, 16, "member id")?;
    let high = buf.get_u64();
    let low = buf.get_u64();
    Ok(MemberId::from_halves(high, low))
}

fn put_address(buf: &mut BytesMut, address: Option<SocketAddr>) {
    match address {
        None => buf.put_u8(FAMILY_NONE),
        Some(SocketAddr::V4(v4)) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        Some(SocketAddr::V6(v6)) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}

fn get_address(buf: &mut &[u8]) -> Result<Option<SocketAddr>> {
    ensure(buf, 1, "address family")?;
    let ip = match buf.get_u8() {
        FAMILY_NONE => return Ok(None),
        FAMILY_V4 => {
            ensure(buf, 4 + 2, "IPv4 address")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            ensure(buf, 16 + 2, "IPv6 address")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(GossipError::Codec(format!("unknown address family {other}")));
        }
    };
    let port = buf.get_u16();
    Ok(Some(SocketAddr::new(ip, port)))
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16((value & 0xFFFF) as u16);
}

fn get_u24(buf: &mut &[u8]) -> u32 {
    let high = u32::from(buf.get_u8());
    let low = u32::from(buf.get_u16());
    (high << 16) | low
}

fn put_attributes(buf: &mut BytesMut, attributes: &Attributes) -> Result<()> {
    put_len(buf, attributes.len(), "attribute map")?;
    for (key, value) in attributes {
        put_string(buf, key)?;
        put_len(buf, value.len(), "attribute value")?;
        buf.put_slice(value);
    }
    Ok(())
}

fn get_attributes(buf: &mut &[u8]) -> Result<Attributes> {
    ensure(buf, 2, "attribute count")?;
    let count = buf.get_u16() as usize;
    let mut attributes = Attributes::new();
    for _ in 0..count {
        let key = get_string(buf)?;
        ensure(buf, 2, "attribute value length")?;
        let len = buf.get_u16() as usize;
        ensure(buf, len, "attribute value")?;
        let value = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn put_snapshots(buf: &mut BytesMut, snapshots: &[Snapshot]) -> Result<()> {
    put_len(buf, snapshots.len(), "snapshot list")?;
    for snapshot in snapshots {
        put_snapshot(buf, snapshot)?;
    }
    Ok(())
}

fn get_snapshots(buf: &mut &[u8]) -> Result<Vec<Snapshot>> {
    ensure(buf, 2, "snapshot count")?;
    let count = buf.get_u16() as usize;
    let mut snapshots = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        snapshots.push(get_snapshot(buf)?);
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payload_snapshot() -> Snapshot {
        let mut attributes = Attributes::new();
        attributes.insert("role".to_string(), Bytes::from_static(b"db"));
        attributes.insert("zone".to_string(), Bytes::from_static(&[1, 2, 3]));
        Snapshot::new(MemberId::new(), SnapshotKind::PayloadUpdate)
            .with_address("10.0.0.7:7946".parse().expect("addr"))
            .with_tcp_port(7947)
            .with_sequence(Sequence::new(-3))
            .with_timestamp(Timestamp::from_raw(0x00AB_CDEF))
            .with_hops(2)
            .with_attributes(attributes)
    }

    // ========== Preamble Tests ==========

    #[test]
    fn preamble_layout() {
        let message = GossipMessage::new(
            "alpha",
            MessageBody::PingRequest {
                sender: Snapshot::new(MemberId::new(), SnapshotKind::Heartbeat),
            },
        );
        let bytes = encode_message(&message).expect("encode");
        assert_eq!(bytes[0], PROTOCOL_MARKER);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(bytes[2], MessageKind::PingRequest.as_u8());
        assert_eq!(&bytes[3..5], &[0, 5]);
        assert_eq!(&bytes[5..10], b"alpha");
    }

    #[test]
    fn snapshot_field_layout() {
        let snapshot = payload_snapshot();
        let mut buf = BytesMut::new();
        put_snapshot(&mut buf, &snapshot).expect("encode");
        assert_eq!(buf.len(), snapshot_len(&snapshot));

        let (high, low) = snapshot.member().halves();
        assert_eq!(buf[0], SnapshotKind::PayloadUpdate.as_u8());
        assert_eq!(&buf[1..9], &high.to_be_bytes());
        assert_eq!(&buf[9..17], &low.to_be_bytes());
        assert_eq!(buf[17], FAMILY_V4);
        assert_eq!(&buf[18..22], &[10, 0, 0, 7]);
        assert_eq!(&buf[22..24], &7946u16.to_be_bytes());
        assert_eq!(&buf[24..26], &7947u16.to_be_bytes());
        assert_eq!(&buf[26..28], &(-3i16).to_be_bytes());
        assert_eq!(&buf[28..31], &[0xAB, 0xCD, 0xEF]);
        assert_eq!(buf[31], 2);
        assert_eq!(&buf[32..34], &[0, 2]);
    }

    // ========== Decode Tests ==========

    #[test]
    fn forwardable_survives_encoding() {
        let message = GossipMessage::new(
            "alpha",
            MessageBody::Forwardable {
                sender: payload_snapshot().with_optional_address(None),
                relayed: vec![
                    payload_snapshot(),
                    Snapshot::new(MemberId::new(), SnapshotKind::Heartbeat)
                        .with_address("[::1]:9000".parse().expect("addr")),
                ],
            },
        );
        let decoded = decode_message(&encode_message(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn first_contact_response_carries_observed_address() {
        let requester = MemberId::new();
        let observed: SocketAddr = "192.168.1.20:40000".parse().expect("addr");
        let message = GossipMessage::new(
            "alpha",
            MessageBody::FirstContactResponse {
                sender: payload_snapshot(),
                requester,
                observed,
            },
        );
        let decoded = decode_message(&encode_message(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn resync_response_lists_wanted_members() {
        let message = GossipMessage::new(
            "alpha",
            MessageBody::ResyncResponse {
                updates: vec![payload_snapshot()],
                wanted: vec![MemberId::new(), MemberId::new()],
            },
        );
        let decoded = decode_message(&encode_message(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn bad_marker_is_rejected() {
        let err = decode_message(&[0x00, PROTOCOL_VERSION, 0]).expect_err("bad marker");
        assert!(matches!(err, GossipError::Codec(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = decode_message(&[PROTOCOL_MARKER, 42, 0]).expect_err("bad version");
        assert!(matches!(err, GossipError::UnsupportedVersion(42)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = decode_message(&[PROTOCOL_MARKER, PROTOCOL_VERSION, 99]).expect_err("bad kind");
        assert!(matches!(err, GossipError::UnknownMessageKind(99)));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let message = GossipMessage::new(
            "alpha",
            MessageBody::PingResponse {
                sender: payload_snapshot(),
            },
        );
        let bytes = encode_message(&message).expect("encode");
        for cut in [4, 10, bytes.len() - 1] {
            assert!(decode_message(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let message = GossipMessage::new(
            "alpha",
            MessageBody::Disconnection {
                sender: Snapshot::new(MemberId::new(), SnapshotKind::Header),
            },
        );
        let mut bytes = encode_message(&message).expect("encode").to_vec();
        bytes.push(0);
        assert!(matches!(decode_message(&bytes), Err(GossipError::Codec(_))));
    }

    #[test]
    fn oversized_value_fails_to_encode() {
        let mut attributes = Attributes::new();
        attributes.insert("big".to_string(), Bytes::from(vec![0u8; 70_000]));
        let sender = Snapshot::new(MemberId::new(), SnapshotKind::PayloadUpdate)
            .with_attributes(attributes);
        let message = GossipMessage::new("alpha", MessageBody::PingRequest { sender });
        assert!(encode_message(&message).is_err());
    }

    #[test]
    fn forwardable_overhead_matches_encoding() {
        let sender = payload_snapshot();
        let relayed = vec![payload_snapshot(), payload_snapshot().demote(SnapshotKind::Heartbeat)];
        let expected = forwardable_overhead("alpha", &sender)
            + relayed.iter().map(snapshot_len).sum::<usize>();
        let message = GossipMessage::new("alpha", MessageBody::Forwardable { sender, relayed });
        assert_eq!(encode_message(&message).expect("encode").len(), expected);
    }

    // ========== Robustness Tests ==========

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_message(&bytes);
        }

        #[test]
        fn arbitrary_bodies_after_valid_preamble_never_panic(
            kind in 0u8..10,
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut bytes = vec![PROTOCOL_MARKER, PROTOCOL_VERSION, kind];
            bytes.extend(body);
            let _ = decode_message(&bytes);
        }
    }
}
