//! Extended operation construction and parsing.
//!
//! A generic exop is represented by [`Exop`](struct.Exop.html). A request
//! struct converts itself into `Exop` through `From`; a response struct
//! implements [`ExopParser`](trait.ExopParser.html).

use crate::result::Result;

use ldap3::asn1::{OctetString, Tag, TagClass};

pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Generic extended operation.
///
/// Since the same struct can be used both for requests and responses,
/// both fields must be declared as optional; when sending an extended
/// request, `name` must not be `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Request or response value. It may be absent in both cases.
    pub val: Option<Vec<u8>>,
}

impl Exop {
    /// Parse the response value with the parser for `T`.
    pub fn parse<T: ExopParser>(&self) -> Result<T> {
        T::parse(self.val.as_deref().unwrap_or(&[]))
    }
}

/// Conversion trait for extended operation responses.
pub trait ExopParser: Sized {
    /// Parse the raw value of the response.
    fn parse(val: &[u8]) -> Result<Self>;
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = vec![Tag::OctetString(OctetString {
        id: 0,
        class: TagClass::Context,
        inner: exop.name.map(String::into_bytes).unwrap_or_default(),
    })];
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

/// StartTLS extended operation ([RFC 4511 §4.14](https://tools.ietf.org/html/rfc4511#section-4.14)).
///
/// Used internally when StartTLS is requested in the connection settings;
/// sending it over an established connection isn't supported.
#[derive(Clone, Debug)]
pub struct StartTls;

impl From<StartTls> for Exop {
    fn from(_: StartTls) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}

/// Who Am I extended operation ([RFC 4532](https://tools.ietf.org/html/rfc4532)).
#[derive(Clone, Debug)]
pub struct WhoAmI;

/// Who Am I response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WhoAmIResp {
    /// Authorization identity, empty for anonymous sessions.
    pub authzid: String,
}

impl From<WhoAmI> for Exop {
    fn from(_: WhoAmI) -> Exop {
        Exop {
            name: Some(WHOAMI_OID.to_owned()),
            val: None,
        }
    }
}

impl ExopParser for WhoAmIResp {
    fn parse(val: &[u8]) -> Result<WhoAmIResp> {
        Ok(WhoAmIResp {
            authzid: String::from_utf8_lossy(val).into_owned(),
        })
    }
}
