//! Reply decoding.

use std::fmt;
use std::net::Ipv4Addr;

use super::{CLASS_IN, Header, Question, RecordType, ResponseCode, name};
use crate::error::DecodeError;
use crate::request::RequestHandle;

/// Addresses retained from an A reply.
pub const MAX_ADDRS: usize = 4;

const RR_FIXED_LEN: usize = 10;

/// One decoded answer. The variant always matches the reply's record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyElement {
    AddressList(Vec<Ipv4Addr>),
    Name(String),
    Mx {
        name: String,
        priority: u16,
    },
    Text(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
}

impl fmt::Display for ReplyElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyElement::AddressList(addrs) => {
                let addrs: Vec<_> = addrs.iter().map(|a| a.to_string()).collect();
                f.write_str(&addrs.join(", "))
            }
            ReplyElement::Name(name) => f.write_str(name),
            ReplyElement::Mx { name, priority } => write!(f, "{priority} {name}"),
            ReplyElement::Text(text) => write!(f, "{text:?}"),
            ReplyElement::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{priority} {weight} {port} {target}"),
        }
    }
}

/// Result of a request, handed to the request's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    rtype: RecordType,
    code: ResponseCode,
    name: String,
    request: Option<RequestHandle>,
    server: Option<String>,
    elements: Vec<ReplyElement>,
}

impl Reply {
    /// A reply without answers, used for timeouts and undecodable responses.
    pub(crate) fn empty(rtype: RecordType, code: ResponseCode, name: &str) -> Self {
        Self {
            rtype,
            code,
            name: name.to_string(),
            request: None,
            server: None,
            elements: Vec::new(),
        }
    }

    pub(crate) fn set_request(&mut self, handle: RequestHandle) {
        self.request = Some(handle);
    }

    pub(crate) fn set_server(&mut self, server: &str) {
        self.server = Some(server.to_string());
    }

    pub fn record_type(&self) -> RecordType {
        self.rtype
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    /// Queried name as echoed by the question section.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request this reply completes; unset for replies decoded standalone.
    pub fn request(&self) -> Option<RequestHandle> {
        self.request
    }

    /// Upstream that answered, or that the final attempt went to.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn elements(&self) -> &[ReplyElement] {
        &self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All addresses of an A reply, in packet order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.elements.iter().flat_map(|e| match e {
            ReplyElement::AddressList(addrs) => addrs.as_slice(),
            _ => &[][..],
        })
        .copied()
    }
}

/// Decode a reply to a query of type `expected`.
///
/// Answer records of other types or classes are skipped. A records are
/// collected into a single [`ReplyElement::AddressList`] of at most
/// [`MAX_ADDRS`] addresses.
pub fn decode_reply(data: &[u8], expected: RecordType) -> Result<Reply, DecodeError> {
    let header = Header::parse(data)?;
    if !header.is_response() {
        return Err(DecodeError::MalformedPacket("not a response"));
    }

    let (question, mut pos) = Question::parse(data)?;
    let mut reply = Reply::empty(expected, header.rcode(), &question.name);
    let mut addrs = Vec::new();

    for _ in 0..header.ancount {
        let (_, next) = name::decode(data, pos)?;
        let Some(fixed) = data.get(next..next + RR_FIXED_LEN) else {
            return Err(DecodeError::MalformedPacket("truncated resource record"));
        };

        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let class = u16::from_be_bytes([fixed[2], fixed[3]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

        let start = next + RR_FIXED_LEN;
        let end = start + rdlength;
        if end > data.len() {
            return Err(DecodeError::MalformedPacket("rdlength exceeds packet"));
        }
        pos = end;

        if rtype != expected.code() || class != CLASS_IN {
            continue;
        }

        let rdata = &data[start..end];
        match expected {
            RecordType::A => {
                let Ok(octets) = <[u8; 4]>::try_from(rdata) else {
                    return Err(DecodeError::MalformedPacket("bad address length"));
                };
                if addrs.len() < MAX_ADDRS {
                    addrs.push(Ipv4Addr::from(octets));
                }
            }
            RecordType::Ptr => {
                let name = rdata_name(data, start, end)?;
                reply.elements.push(ReplyElement::Name(name));
            }
            RecordType::Mx => {
                if rdlength < 3 {
                    return Err(DecodeError::MalformedPacket("short MX record"));
                }
                let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
                let name = rdata_name(data, start + 2, end)?;
                reply.elements.push(ReplyElement::Mx { name, priority });
            }
            RecordType::Txt | RecordType::Spf => {
                reply.elements.push(ReplyElement::Text(character_strings(rdata)?));
            }
            RecordType::Srv => {
                if rdlength < 7 {
                    return Err(DecodeError::MalformedPacket("short SRV record"));
                }
                let field = |i: usize| u16::from_be_bytes([rdata[i], rdata[i + 1]]);
                let target = rdata_name(data, start + 6, end)?;
                reply.elements.push(ReplyElement::Srv {
                    priority: field(0),
                    weight: field(2),
                    port: field(4),
                    target,
                });
            }
        }
    }

    if !addrs.is_empty() {
        reply.elements.push(ReplyElement::AddressList(addrs));
    }
    Ok(reply)
}

/// Decode a name embedded in RDATA; it must not run past the record.
fn rdata_name(data: &[u8], start: usize, end: usize) -> Result<String, DecodeError> {
    let (name, name_end) = name::decode(data, start)?;
    if name_end > end {
        return Err(DecodeError::MalformedPacket("name exceeds rdata"));
    }
    Ok(name)
}

fn character_strings(rdata: &[u8]) -> Result<String, DecodeError> {
    let mut text = String::new();
    let mut pos = 0;

    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        let Some(chunk) = rdata.get(pos + 1..pos + 1 + len) else {
            return Err(DecodeError::MalformedPacket("truncated character string"));
        };
        text.push_str(&String::from_utf8_lossy(chunk));
        pos += 1 + len;
    }
    Ok(text)
}
