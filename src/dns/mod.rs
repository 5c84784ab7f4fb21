//! DNS message parsing and construction.
//!
//! Only what the resolver needs: building a single-question query and
//! decoding the answer section of a reply for the supported record types.
//! Every length taken from the wire is checked against the buffer before use.

mod name;
mod reply;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{DecodeError, EncodeError, ParseRecordTypeError};

pub use name::{MAX_LABEL_LEN, MAX_NAME_LEN};
pub use reply::{MAX_ADDRS, Reply, ReplyElement, decode_reply};

pub(crate) use name::normalize as normalize_name;

pub const HEADER_LEN: usize = 12;

/// Largest datagram accepted from an upstream.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000F;

/// Record types the resolver can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Mx,
    Txt,
    Srv,
    Spf,
}

impl RecordType {
    /// Wire value of the QTYPE.
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
            RecordType::Spf => 99,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A request",
            RecordType::Ptr => "PTR request",
            RecordType::Mx => "MX request",
            RecordType::Txt => "TXT request",
            RecordType::Srv => "SRV request",
            RecordType::Spf => "SPF request",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ParseRecordTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(RecordType::A),
            "ptr" => Ok(RecordType::Ptr),
            "mx" => Ok(RecordType::Mx),
            "txt" => Ok(RecordType::Txt),
            "srv" => Ok(RecordType::Srv),
            "spf" => Ok(RecordType::Spf),
            _ => Err(ParseRecordTypeError(s.to_string())),
        }
    }
}

/// Response status carried by a [`Reply`].
///
/// `Timeout` never appears on the wire; the resolver uses it when an
/// upstream never answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
    Unknown(u8),
    Timeout,
}

impl ResponseCode {
    pub fn from_wire(rcode: u8) -> Self {
        match rcode {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            6 => ResponseCode::YxDomain,
            7 => ResponseCode::YxRrSet,
            8 => ResponseCode::NxRrSet,
            9 => ResponseCode::NotAuth,
            10 => ResponseCode::NotZone,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::NoError => "NOERROR",
            ResponseCode::FormErr => "FORMERR",
            ResponseCode::ServFail => "SERVFAIL",
            ResponseCode::NxDomain => "NXDOMAIN",
            ResponseCode::NotImp => "NOTIMP",
            ResponseCode::Refused => "REFUSED",
            ResponseCode::YxDomain => "YXDOMAIN",
            ResponseCode::YxRrSet => "YXRRSET",
            ResponseCode::NxRrSet => "NXRRSET",
            ResponseCode::NotAuth => "NOTAUTH",
            ResponseCode::NotZone => "NOTZONE",
            ResponseCode::Unknown(_) => "UNKNOWN",
            ResponseCode::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    fn query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let Some(h) = data.get(..HEADER_LEN) else {
            return Err(DecodeError::MalformedPacket("truncated header"));
        };
        let field = |i: usize| u16::from_be_bytes([h[i], h[i + 1]]);

        Ok(Self {
            id: field(0),
            flags: field(2),
            qdcount: field(4),
            ancount: field(6),
            nscount: field(8),
            arcount: field(10),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> ResponseCode {
        ResponseCode::from_wire((self.flags & RCODE_MASK) as u8)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.qdcount.to_be_bytes());
        buf.extend_from_slice(&self.ancount.to_be_bytes());
        buf.extend_from_slice(&self.nscount.to_be_bytes());
        buf.extend_from_slice(&self.arcount.to_be_bytes());
    }
}

/// A question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Parse the single question following the header.
    ///
    /// Returns the question and the offset of the first answer record.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let header = Header::parse(data)?;
        if header.qdcount != 1 {
            return Err(DecodeError::MalformedPacket("unexpected question count"));
        }

        let (name, pos) = name::decode(data, HEADER_LEN)?;
        let Some(fixed) = data.get(pos..pos + 4) else {
            return Err(DecodeError::MalformedPacket("truncated question"));
        };

        let question = Self {
            name,
            qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
            qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        };
        Ok((question, pos + 4))
    }

    /// Whether this question echoes a query for `name` of type `rtype`.
    ///
    /// Names compare case-insensitively.
    pub fn matches(&self, name: &str, rtype: RecordType) -> bool {
        self.qtype == rtype.code()
            && self.qclass == CLASS_IN
            && self.name.eq_ignore_ascii_case(normalize_name(name))
    }
}

/// Whether `received` echoes the question of the query `sent`.
///
/// Label boundaries must agree and label bytes compare ASCII
/// case-insensitively; type and class must be identical.
pub fn echoes_question(sent: &[u8], received: &[u8]) -> bool {
    let (Ok((sent_labels, sent_fixed)), Ok((labels, fixed))) =
        (question_wire(sent), question_wire(received))
    else {
        return false;
    };

    sent_fixed == fixed
        && sent_labels.len() == labels.len()
        && sent_labels
            .iter()
            .zip(&labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

fn question_wire(data: &[u8]) -> Result<(Vec<&[u8]>, &[u8]), DecodeError> {
    let header = Header::parse(data)?;
    if header.qdcount != 1 {
        return Err(DecodeError::MalformedPacket("unexpected question count"));
    }

    let (labels, pos) = name::labels(data, HEADER_LEN)?;
    let Some(fixed) = data.get(pos..pos + 4) else {
        return Err(DecodeError::MalformedPacket("truncated question"));
    };
    Ok((labels, fixed))
}

/// Build a recursive query for `name`.
///
/// Fails without allocating a packet if the name breaks the label (63) or
/// total (255) length limits.
pub fn encode_query(name: &str, rtype: RecordType, id: u16) -> Result<Vec<u8>, EncodeError> {
    name::check(name)?;

    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    Header::query(id).write(&mut packet);
    name::encode(&mut packet, name);
    packet.extend_from_slice(&rtype.code().to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Read the transaction ID of a datagram that is at least a full header.
pub fn peek_id(data: &[u8]) -> Option<u16> {
    if data.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

/// Overwrite the transaction ID of an encoded message.
pub fn set_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Reverse-lookup name for an IPv4 address (`d.c.b.a.in-addr.arpa`).
pub fn ptr_name(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{d}.{c}.{b}.{a}.in-addr.arpa")
}

/// Service lookup name (`_service._proto.name`).
pub fn srv_name(service: &str, proto: &str, name: &str) -> String {
    format!("_{service}._{proto}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_response(mut packet: Vec<u8>) -> Vec<u8> {
        packet[2] |= 0x80;
        packet
    }

    #[test]
    fn encode_query_builds_header_and_question() {
        let packet = encode_query("example.com", RecordType::Mx, 0xBEEF).unwrap();

        assert_eq!(&packet[..2], &[0xBE, 0xEF]);
        assert_eq!(&packet[2..4], &[0x01, 0x00]);
        assert_eq!(&packet[4..6], &[0x00, 0x01]);
        assert_eq!(&packet[6..12], &[0; 6]);
        assert_eq!(&packet[12..25], b"\x07example\x03com\x00");
        assert_eq!(&packet[25..], &[0x00, 0x0F, 0x00, 0x01]);
    }

    #[test]
    fn question_round_trips() {
        let names = [
            "example.com",
            "a",
            "mail.example.org.",
            "1.2.0.192.in-addr.arpa",
            "_sip._udp.example.net",
        ];
        let types = [
            RecordType::A,
            RecordType::Ptr,
            RecordType::Mx,
            RecordType::Txt,
            RecordType::Srv,
            RecordType::Spf,
        ];

        for name in names {
            for rtype in types {
                let packet = as_response(encode_query(name, rtype, 7).unwrap());
                let reply = decode_reply(&packet, rtype).unwrap();

                assert_eq!(reply.name(), name.trim_end_matches('.'));
                assert_eq!(reply.record_type(), rtype);

                let (question, _) = Question::parse(&packet).unwrap();
                assert!(question.matches(name, rtype));
            }
        }
    }

    #[test]
    fn question_match_ignores_case_but_not_type() {
        let packet = encode_query("Example.COM", RecordType::A, 1).unwrap();
        let (question, _) = Question::parse(&packet).unwrap();

        assert!(question.matches("example.com", RecordType::A));
        assert!(!question.matches("example.com", RecordType::Txt));
        assert!(!question.matches("example.org", RecordType::A));
    }

    #[test]
    fn echoed_question_keeps_label_boundaries() {
        let sent = encode_query("example.com", RecordType::A, 9).unwrap();

        let mut single_label = sent[..HEADER_LEN].to_vec();
        single_label.extend_from_slice(b"\x0bexample.com\x00\x00\x01\x00\x01");
        let single_label = as_response(single_label);
        assert!(!echoes_question(&sent, &single_label));
        let (question, _) = Question::parse(&single_label).unwrap();
        assert!(!question.matches("example.com", RecordType::A));

        let upper = as_response(encode_query("EXAMPLE.com", RecordType::A, 9).unwrap());
        let other_type = as_response(encode_query("example.com", RecordType::Mx, 9).unwrap());
        assert!(echoes_question(&sent, &upper));
        assert!(!echoes_question(&sent, &other_type));
        assert!(!echoes_question(&sent, &sent[..20]));
    }

    #[test]
    fn encode_query_rejects_long_names() {
        let label = "a".repeat(64);
        assert_eq!(
            encode_query(&label, RecordType::A, 1),
            Err(EncodeError::NameTooLong)
        );

        let long = vec!["abcdefghi"; 26].join(".");
        assert_eq!(
            encode_query(&long, RecordType::A, 1),
            Err(EncodeError::NameTooLong)
        );
    }

    #[test]
    fn set_id_rewrites_only_the_id() {
        let mut packet = encode_query("example.com", RecordType::A, 1).unwrap();
        let original = packet.clone();

        set_id(&mut packet, 0x1234);

        assert_eq!(peek_id(&packet), Some(0x1234));
        assert_eq!(&packet[2..], &original[2..]);
    }

    #[test]
    fn peek_id_requires_full_header() {
        assert_eq!(peek_id(&[0x12, 0x34, 0, 0]), None);
        assert_eq!(peek_id(&[0x12, 0x34, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]), Some(0x1234));
    }

    #[test]
    fn helper_names() {
        assert_eq!(
            ptr_name(Ipv4Addr::new(192, 0, 2, 1)),
            "1.2.0.192.in-addr.arpa"
        );
        assert_eq!(srv_name("xmpp", "tcp", "example.com"), "_xmpp._tcp.example.com");
    }

    #[test]
    fn diagnostic_strings() {
        assert_eq!(ResponseCode::from_wire(3).to_string(), "NXDOMAIN");
        assert_eq!(ResponseCode::from_wire(10).as_str(), "NOTZONE");
        assert_eq!(ResponseCode::from_wire(14), ResponseCode::Unknown(14));
        assert_eq!(ResponseCode::Timeout.as_str(), "TIMEOUT");
        assert_eq!(RecordType::Srv.to_string(), "SRV request");
        assert_eq!("MX".parse::<RecordType>(), Ok(RecordType::Mx));
        assert!("aaaa".parse::<RecordType>().is_err());
    }
}
