//! Request and response controls.
//!
//! A control travels in the message envelope, after the protocol operation.
//! The library only needs a single concrete control, the password policy
//! one (see [`password_policy`](../password_policy/index.html)), so controls
//! are kept in their general form, [`RawControl`](struct.RawControl.html).
//! A request control is attached to the next operation with
//! [`with_controls()`](../struct.LdapConnection.html#method.with_controls).

use crate::result::{LdapError, Result};

use ldap3::asn1::{ASNTag, Boolean, OctetString, Sequence, StructureTag, Tag, Types, PL};

/// Generic control.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality, has no meaning on response.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Create a non-critical control.
    pub fn new<S: Into<String>>(ctype: S, val: Option<Vec<u8>>) -> RawControl {
        RawControl {
            ctype: ctype.into(),
            crit: false,
            val,
        }
    }

    /// Mark the control as critical.
    pub fn critical(mut self) -> RawControl {
        self.crit = true;
        self
    }
}

/// Conversion trait for single control instances and control vectors, accepted
/// by `with_controls()`.
pub trait IntoRawControlVec {
    fn into(self) -> Vec<RawControl>;
}

impl IntoRawControlVec for RawControl {
    fn into(self) -> Vec<RawControl> {
        vec![self]
    }
}

impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

pub(crate) fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

fn malformed() -> LdapError {
    LdapError::Decoding(String::from("malformed control"))
}

pub(crate) fn parse_controls(t: StructureTag) -> Result<Vec<RawControl>> {
    let tags = t.expect_constructed().ok_or_else(malformed)?;
    let mut ctrls = Vec::with_capacity(tags.len());
    for ctrl in tags {
        let mut components = ctrl.expect_constructed().ok_or_else(malformed)?.into_iter();
        let ctype = components
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|v| String::from_utf8(v).ok())
            .ok_or_else(malformed)?;
        let (crit, maybe_val) = match components.next() {
            None => (false, None),
            Some(c) if c.id == Types::Boolean as u64 => match c.payload {
                PL::P(ref v) => (v.first().map_or(false, |b| *b != 0), components.next()),
                PL::C(_) => return Err(malformed()),
            },
            Some(c) if c.id == Types::OctetString as u64 => (false, Some(c)),
            Some(_) => return Err(malformed()),
        };
        let val = match maybe_val {
            Some(v) => Some(v.expect_primitive().ok_or_else(malformed)?),
            None => None,
        };
        ctrls.push(RawControl { ctype, crit, val });
    }
    Ok(ctrls)
}
