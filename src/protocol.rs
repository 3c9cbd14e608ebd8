use std::fmt;

use crate::controls::{build_tag, parse_controls, RawControl};
use crate::exop::Exop;
use crate::future::SearchSink;
use crate::result::{LdapError, LdapResult, Result};
use crate::search::{parse_refs, ResultEntry};
use crate::RequestId;

use bytes::{Buf, BytesMut};
use ldap3::asn1::{
    parse_tag, parse_uint, write, ASNTag, Integer, Sequence, StructureTag, Tag, TagClass, Types,
    PL,
};
use tokio_util::codec::{Decoder, Encoder};

/// OID of the Notice of Disconnection unsolicited notification.
pub(crate) const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

pub(crate) struct LdapCodec;

pub(crate) type MaybeControls = Option<Vec<RawControl>>;

/// Driver-side completion of a single-response operation.
pub(crate) type ResultDelivery = Box<dyn FnOnce(Result<Message>) + Send>;

/// Operation submitted to the connection driver, together with the
/// message ID, the protocol op and the request controls.
pub(crate) type OpRequest = (RequestId, LdapOp, Tag, MaybeControls);

pub(crate) enum LdapOp {
    Single(ResultDelivery),
    Search(SearchSink),
    Abandon(RequestId),
    Unbind,
}

impl fmt::Debug for LdapOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LdapOp::Single(_) => f.write_str("Single"),
            LdapOp::Search(_) => f.write_str("Search"),
            LdapOp::Abandon(id) => write!(f, "Abandon({})", id),
            LdapOp::Unbind => f.write_str("Unbind"),
        }
    }
}

/// Classification of a decoded response, used for routing and by the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// SearchResultEntry.
    Entry,
    /// SearchResultReference.
    Reference,
    /// IntermediateResponse.
    Intermediate,
    /// SearchResultDone, terminating a search.
    Done,
    /// ExtendedResponse.
    Extended,
    /// Any other response carrying an LDAPResult (Bind, Modify, ...).
    Result,
}

/// Decoded protocol operation of a response message.
#[derive(Clone, Debug)]
pub enum Response {
    Bind {
        result: LdapResult,
        sasl_creds: Option<Vec<u8>>,
    },
    Entry(ResultEntry),
    Reference(Vec<String>),
    Intermediate {
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
    Done(LdapResult),
    Extended {
        result: LdapResult,
        exop: Exop,
    },
    Other {
        op: u64,
        result: LdapResult,
    },
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Entry(_) => ResponseKind::Entry,
            Response::Reference(_) => ResponseKind::Reference,
            Response::Intermediate { .. } => ResponseKind::Intermediate,
            Response::Done(_) => ResponseKind::Done,
            Response::Extended { .. } => ResponseKind::Extended,
            Response::Bind { .. } | Response::Other { .. } => ResponseKind::Result,
        }
    }

    /// The LDAPResult component, for the responses which have one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Response::Bind { result, .. }
            | Response::Done(result)
            | Response::Extended { result, .. }
            | Response::Other { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// A complete response message: ID, protocol op and response controls.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: RequestId,
    pub response: Response,
    pub controls: Vec<RawControl>,
}

impl Message {
    pub fn kind(&self) -> ResponseKind {
        self.response.kind()
    }

    pub(crate) fn parse(
        id: RequestId,
        protoop: StructureTag,
        controls: Vec<RawControl>,
    ) -> Result<Message> {
        if protoop.class != TagClass::Application {
            return Err(decoding("protocol op is not application-tagged"));
        }
        let response = match protoop.id {
            4 => Response::Entry(ResultEntry::with_controls(protoop, controls.clone())),
            19 => Response::Reference(parse_refs(protoop)?),
            25 => {
                let (name, value) = parse_name_value(protoop, 0, 1)?;
                Response::Intermediate { name, value }
            }
            op => {
                let mut parsed = ParsedResult::from_tag(protoop)?;
                parsed.result.ctrls = controls.clone();
                match op {
                    1 => Response::Bind {
                        result: parsed.result,
                        sasl_creds: parsed.sasl_creds,
                    },
                    5 => Response::Done(parsed.result),
                    24 => Response::Extended {
                        result: parsed.result,
                        exop: Exop {
                            name: parsed.exop_name,
                            val: parsed.exop_val,
                        },
                    },
                    op => Response::Other {
                        op,
                        result: parsed.result,
                    },
                }
            }
        };
        Ok(Message {
            id,
            response,
            controls,
        })
    }

    /// True if this is an unsolicited Notice of Disconnection.
    pub(crate) fn is_notice_of_disconnection(&self) -> bool {
        match self.response {
            Response::Extended { ref exop, .. } => {
                self.id == 0 && exop.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
            }
            _ => false,
        }
    }
}

fn decoding(what: &str) -> LdapError {
    LdapError::Decoding(String::from(what))
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| decoding(what))
}

struct ParsedResult {
    result: LdapResult,
    sasl_creds: Option<Vec<u8>>,
    exop_name: Option<String>,
    exop_val: Option<Vec<u8>>,
}

impl ParsedResult {
    fn from_tag(t: StructureTag) -> Result<ParsedResult> {
        let mut tags = t
            .expect_constructed()
            .ok_or_else(|| decoding("result sequence"))?
            .into_iter();
        let rc = tags
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Enumerated as u64))
            .and_then(|t| t.expect_primitive())
            .ok_or_else(|| decoding("result code"))?;
        let rc = match parse_uint(rc.as_slice()) {
            Ok((_, rc)) => rc as u32,
            _ => return Err(decoding("result code")),
        };
        let matched = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or_else(|| decoding("matched dn"))?;
        let text = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or_else(|| decoding("diagnostic message"))?;
        let mut parsed = ParsedResult {
            result: LdapResult {
                rc,
                matched: utf8(matched, "matched dn")?,
                text: String::from_utf8_lossy(&text).into_owned(),
                refs: vec![],
                ctrls: vec![],
            },
            sasl_creds: None,
            exop_name: None,
            exop_val: None,
        };
        for comp in tags {
            match comp.id {
                3 => parsed.result.refs.extend(parse_refs(comp)?),
                7 => {
                    parsed.sasl_creds =
                        Some(comp.expect_primitive().ok_or_else(|| decoding("sasl creds"))?)
                }
                10 => {
                    let name = comp.expect_primitive().ok_or_else(|| decoding("exop name"))?;
                    parsed.exop_name = Some(utf8(name, "exop name")?);
                }
                11 => {
                    parsed.exop_val =
                        Some(comp.expect_primitive().ok_or_else(|| decoding("exop value"))?)
                }
                _ => (),
            }
        }
        Ok(parsed)
    }
}

fn parse_name_value(
    t: StructureTag,
    name_id: u64,
    value_id: u64,
) -> Result<(Option<String>, Option<Vec<u8>>)> {
    let mut name = None;
    let mut value = None;
    for comp in t
        .expect_constructed()
        .ok_or_else(|| decoding("intermediate response"))?
    {
        if comp.id == name_id {
            let raw = comp.expect_primitive().ok_or_else(|| decoding("response name"))?;
            name = Some(utf8(raw, "response name")?);
        } else if comp.id == value_id {
            value = Some(comp.expect_primitive().ok_or_else(|| decoding("response value"))?);
        }
    }
    Ok((name, value))
}

/// Split one message envelope off the buffer: message ID, protocol op and controls.
///
/// Returns `Ok(None)` if the buffer doesn't yet contain a whole message.
pub(crate) fn decode_envelope(
    buf: &mut BytesMut,
) -> Result<Option<(RequestId, StructureTag, Vec<RawControl>)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (consumed, tag) = match parse_tag(&buf[..]) {
        Err(e) if e.is_incomplete() => return Ok(None),
        Err(_) => return Err(decoding("envelope")),
        Ok((rest, tag)) => (buf.len() - rest.len(), tag),
    };
    buf.advance(consumed);
    let mut tags = tag
        .match_id(Types::Sequence as u64)
        .and_then(|t| t.expect_constructed())
        .ok_or_else(|| decoding("envelope sequence"))?;
    if tags.len() < 2 {
        return Err(decoding("short envelope"));
    }
    let mut last = tags.pop().ok_or_else(|| decoding("envelope element"))?;
    let has_controls = match last {
        StructureTag {
            id: 0,
            class: TagClass::Context,
            ref payload,
        } => match *payload {
            PL::C(_) => true,
            PL::P(_) => return Err(decoding("primitive controls")),
        },
        StructureTag {
            id: 10,
            class: TagClass::Context,
            ..
        } if tags.len() >= 2 => {
            // Active Directory places the Notice of Disconnection OID after the
            // ExtendedResponse, where the controls would be. Skip it.
            last = tags.pop().ok_or_else(|| decoding("envelope element"))?;
            false
        }
        _ => false,
    };
    let (protoop, controls) = if has_controls {
        let protoop = tags.pop().ok_or_else(|| decoding("protocol op"))?;
        (protoop, parse_controls(last)?)
    } else {
        (last, vec![])
    };
    let msgid = tags
        .pop()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::Integer as u64))
        .and_then(|t| t.expect_primitive())
        .ok_or_else(|| decoding("message id"))?;
    let msgid = match parse_uint(msgid.as_slice()) {
        Ok((_, id)) => id as RequestId,
        _ => return Err(decoding("message id")),
    };
    Ok(Some((msgid, protoop, controls)))
}

/// Encode a message envelope around `tag`.
pub(crate) fn encode_envelope(
    id: RequestId,
    tag: Tag,
    controls: MaybeControls,
    into: &mut BytesMut,
) -> Result<()> {
    let mut msg = vec![
        Tag::Integer(Integer {
            inner: id as i64,
            ..Default::default()
        }),
        tag,
    ];
    if let Some(controls) = controls {
        msg.push(Tag::StructureTag(StructureTag {
            id: 0,
            class: TagClass::Context,
            payload: PL::C(controls.into_iter().map(build_tag).collect()),
        }));
    }
    let outstruct = Tag::Sequence(Sequence {
        inner: msg,
        ..Default::default()
    })
    .into_structure();
    write::encode_into(into, outstruct)?;
    Ok(())
}

impl Decoder for LdapCodec {
    type Item = Message;
    type Error = LdapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match decode_envelope(buf)? {
            Some((id, protoop, controls)) => Message::parse(id, protoop, controls).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<(RequestId, Tag, MaybeControls)> for LdapCodec {
    type Error = LdapError;

    fn encode(&mut self, msg: (RequestId, Tag, MaybeControls), into: &mut BytesMut) -> Result<()> {
        let (id, tag, controls) = msg;
        encode_envelope(id, tag, controls, into)
    }
}
