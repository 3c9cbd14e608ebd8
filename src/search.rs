use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use crate::controls::RawControl;
use crate::result::{LdapError, Result};

use ldap3::asn1::{
    Boolean, Enumerated, Integer, OctetString, Sequence, StructureTag, Tag, TagClass,
};
use ldap3::parse_filter;

/// Possible values for search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Base object; search only the object named in the base DN.
    Base = 0,
    /// Search the objects immediately below the base DN.
    OneLevel = 1,
    /// Search the object named in the base DN and the whole subtree below it.
    Subtree = 2,
}

/// Possible values for alias dereferencing during search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Dereference while retrieving objects according to search scope.
    Searching = 1,
    /// Dereference while finding the base object.
    Finding = 2,
    /// Always dereference.
    Always = 3,
}

/// Wrapper for the internal structure of a result entry.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<RawControl>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    pub(crate) fn with_controls(st: StructureTag, ctrls: Vec<RawControl>) -> ResultEntry {
        ResultEntry(st, ctrls)
    }

    /// Returns true if the enclosed entry is a referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// Returns true if the enclosed entry is an intermediate message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }
}

/// Additional parameters for the Search operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SearchOptions {
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
}

impl SearchOptions {
    /// Create an instance of the structure with default values.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    /// Set the method for dereferencing aliases.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Set the indicator of returning just attribute names (`true`) vs. names and values (`false`).
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the server-side time limit, in seconds. This is not a network timeout.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the size limit, in entries, for the whole search operation.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }
}

/// Decides which attributes hold binary values.
///
/// Values of binary attributes are never converted to strings; they're placed
/// in [`SearchEntry::bin_attrs`](struct.SearchEntry.html#structfield.bin_attrs).
pub trait BinaryAttributeDetector: Debug + Send + Sync {
    fn is_binary(&self, attr: &str) -> bool;
}

const DEFAULT_BINARY_ATTRS: &[&str] = &[
    "photo",
    "personalsignature",
    "audio",
    "jpegphoto",
    "javaserializeddata",
    "thumbnailphoto",
    "thumbnaillogo",
    "userpassword",
    "usercertificate",
    "cacertificate",
    "authorityrevocationlist",
    "certificaterevocationlist",
    "crosscertificatepair",
    "x500uniqueidentifier",
    "objectguid",
    "objectsid",
    "msexchmailboxguid",
    "msexchmailboxsecuritydescriptor",
    "ntsecuritydescriptor",
];

/// Detector recognizing well-known binary attribute types, the `;binary`
/// attribute option, and any attribute names added by the user.
///
/// Names are compared case-insensitively.
#[derive(Clone, Debug)]
pub struct DefaultBinaryAttributeDetector {
    attrs: HashSet<String>,
}

impl Default for DefaultBinaryAttributeDetector {
    fn default() -> Self {
        DefaultBinaryAttributeDetector {
            attrs: DEFAULT_BINARY_ATTRS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl DefaultBinaryAttributeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat `attrs` as binary.
    pub fn with_attributes<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.attrs
            .extend(attrs.into_iter().map(|a| a.as_ref().to_ascii_lowercase()));
        self
    }
}

impl BinaryAttributeDetector for DefaultBinaryAttributeDetector {
    fn is_binary(&self, attr: &str) -> bool {
        let attr = attr.to_ascii_lowercase();
        let mut parts = attr.split(';');
        let base = parts.next().unwrap_or("");
        parts.any(|opt| opt == "binary") || self.attrs.contains(base)
    }
}

/// Parsed search result entry.
///
/// Values of attributes which the [`BinaryAttributeDetector`](trait.BinaryAttributeDetector.html)
/// marks as binary go to `bin_attrs`. The remaining values are converted to UTF-8
/// `String`s; if any value of an attribute fails the conversion, the attribute
/// and all its values are placed in `bin_attrs` as well.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Binary-valued attributes.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

fn malformed(what: &str) -> LdapError {
    LdapError::Decoding(format!("malformed search entry: {}", what))
}

impl SearchEntry {
    /// Parse raw BER data and convert it into attribute maps, using the
    /// default binary attribute detector.
    pub fn construct(re: ResultEntry) -> Result<SearchEntry> {
        Self::construct_with(re, &DefaultBinaryAttributeDetector::default())
    }

    /// Parse raw BER data and convert it into attribute maps, consulting
    /// `detector` for binary attributes.
    pub fn construct_with(
        re: ResultEntry,
        detector: &dyn BinaryAttributeDetector,
    ) -> Result<SearchEntry> {
        let mut tags = re
            .0
            .match_id(4)
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| malformed("entry"))?
            .into_iter();
        let dn = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|dn| String::from_utf8(dn).ok())
            .ok_or_else(|| malformed("dn"))?;
        let mut attr_vals = HashMap::new();
        let mut bin_attr_vals = HashMap::new();
        let attrs = tags
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| malformed("attributes"))?;
        for a_v in attrs {
            let mut part_attr = a_v
                .expect_constructed()
                .ok_or_else(|| malformed("partial attribute"))?
                .into_iter();
            let a_type = part_attr
                .next()
                .and_then(|t| t.expect_primitive())
                .and_then(|t| String::from_utf8(t).ok())
                .ok_or_else(|| malformed("attribute type"))?;
            let values = part_attr
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or_else(|| malformed("attribute values"))?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or_else(|| malformed("value")))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            if detector.is_binary(&a_type) || values.iter().any(|v| std::str::from_utf8(v).is_err()) {
                bin_attr_vals.insert(a_type, values);
            } else {
                let values = values
                    .into_iter()
                    .map(|v| String::from_utf8(v).map_err(|_| malformed("value")))
                    .collect::<Result<Vec<String>>>()?;
                attr_vals.insert(a_type, values);
            }
        }
        Ok(SearchEntry {
            dn,
            attrs: attr_vals,
            bin_attrs: bin_attr_vals,
        })
    }
}

/// Parse the referrals from the supplied BER-encoded sequence.
pub fn parse_refs(t: StructureTag) -> Result<Vec<String>> {
    t.expect_constructed()
        .ok_or_else(|| LdapError::Decoding(String::from("referrals")))?
        .into_iter()
        .map(|t| {
            t.expect_primitive()
                .and_then(|v| String::from_utf8(v).ok())
                .ok_or_else(|| LdapError::Decoding(String::from("referral uri")))
        })
        .collect()
}

/// Build the SearchRequest protocol op.
pub(crate) fn search_request<S: AsRef<str>>(
    base: &str,
    scope: Scope,
    filter: &str,
    attrs: &[S],
    opts: &SearchOptions,
) -> Result<Tag> {
    Ok(Tag::Sequence(Sequence {
        id: 3,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(base.as_bytes()),
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: scope as i64,
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: opts.deref as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.sizelimit as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.timelimit as i64,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: opts.typesonly,
                ..Default::default()
            }),
            parse_filter(filter).map_err(|_| LdapError::FilterParsing)?,
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|s| {
                        Tag::OctetString(OctetString {
                            inner: Vec::from(s.as_ref()),
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    }))
}
