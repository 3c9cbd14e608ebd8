//! Password policy control and pooled authentication.
//!
//! The control is specified in
//! [draft-behera-ldap-password-policy](https://tools.ietf.org/html/draft-behera-ldap-password-policy-11).
//! Sent with a Bind request, it asks the server to report the state of the
//! account's password: a warning about upcoming expiration or remaining
//! grace logins, or the reason for a rejection.

use std::fmt;

use crate::controls::RawControl;
use crate::factory::ConnectionFactory;
use crate::pool::Pool;
use crate::poolable::PoolableConnectionFactory;
use crate::result::{LdapError, Result};

use bytes::BytesMut;
use ldap3::asn1::{
    parse_tag, parse_uint, write, ASNTag, Enumerated, Integer, Sequence, StructureTag, Tag, TagClass,
};

pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";

/// Password policy request control. It has no value.
#[derive(Clone, Copy, Debug)]
pub struct PasswordPolicy;

impl From<PasswordPolicy> for RawControl {
    fn from(_pp: PasswordPolicy) -> RawControl {
        RawControl::new(PASSWORD_POLICY_OID, None)
    }
}

/// Warning about the state of a still usable password.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordWarning {
    /// Seconds until the password expires.
    TimeBeforeExpiration(u32),
    /// Remaining logins with an expired password.
    GraceLogins(u32),
}

/// Reason for a password or account rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordPolicyError {
    PasswordExpired,
    AccountLocked,
    ChangeAfterReset,
    PasswordModNotAllowed,
    MustSupplyOldPassword,
    InsufficientPasswordQuality,
    PasswordTooShort,
    PasswordTooYoung,
    PasswordInHistory,
}

impl PasswordPolicyError {
    fn from_code(code: u64) -> Option<PasswordPolicyError> {
        use PasswordPolicyError::*;
        Some(match code {
            0 => PasswordExpired,
            1 => AccountLocked,
            2 => ChangeAfterReset,
            3 => PasswordModNotAllowed,
            4 => MustSupplyOldPassword,
            5 => InsufficientPasswordQuality,
            6 => PasswordTooShort,
            7 => PasswordTooYoung,
            8 => PasswordInHistory,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for PasswordPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            PasswordPolicyError::PasswordExpired => "password expired",
            PasswordPolicyError::AccountLocked => "account locked",
            PasswordPolicyError::ChangeAfterReset => "password must be changed after reset",
            PasswordPolicyError::PasswordModNotAllowed => "password modification not allowed",
            PasswordPolicyError::MustSupplyOldPassword => "old password must be supplied",
            PasswordPolicyError::InsufficientPasswordQuality => "insufficient password quality",
            PasswordPolicyError::PasswordTooShort => "password too short",
            PasswordPolicyError::PasswordTooYoung => "password too young",
            PasswordPolicyError::PasswordInHistory => "password in history",
        };
        f.write_str(text)
    }
}

/// Parsed value of the password policy response control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PasswordPolicyResponse {
    pub warning: Option<PasswordWarning>,
    pub error: Option<PasswordPolicyError>,
}

fn malformed() -> LdapError {
    LdapError::Decoding(String::from("malformed password policy control"))
}

fn uint(t: StructureTag) -> Result<u64> {
    let bytes = t.expect_primitive().ok_or_else(malformed)?;
    match parse_uint(bytes.as_slice()) {
        Ok((_, n)) => Ok(n),
        _ => Err(malformed()),
    }
}

impl PasswordPolicyResponse {
    /// Parse the control value.
    pub fn parse(val: &[u8]) -> Result<PasswordPolicyResponse> {
        let tags = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => return Err(malformed()),
        }
        .expect_constructed()
        .ok_or_else(malformed)?;
        let mut resp = PasswordPolicyResponse::default();
        for tag in tags {
            if tag.class != TagClass::Context {
                return Err(malformed());
            }
            match tag.id {
                0 => {
                    let choice = tag
                        .expect_constructed()
                        .and_then(|mut inner| inner.pop())
                        .ok_or_else(malformed)?;
                    let id = choice.id;
                    let value = u32::try_from(uint(choice)?).map_err(|_| malformed())?;
                    resp.warning = Some(match id {
                        0 => PasswordWarning::TimeBeforeExpiration(value),
                        1 => PasswordWarning::GraceLogins(value),
                        _ => return Err(malformed()),
                    });
                }
                1 => {
                    resp.error = Some(PasswordPolicyError::from_code(uint(tag)?).ok_or_else(malformed)?);
                }
                _ => return Err(malformed()),
            }
        }
        Ok(resp)
    }

    /// Find and parse the password policy control among the response
    /// controls. `None` if the server didn't send one.
    pub fn from_controls(ctrls: &[RawControl]) -> Result<Option<PasswordPolicyResponse>> {
        match ctrls.iter().find(|c| c.ctype == PASSWORD_POLICY_OID) {
            Some(RawControl { val: Some(val), .. }) => Ok(Some(Self::parse(val)?)),
            Some(_) => Err(malformed()),
            None => Ok(None),
        }
    }

    /// Encode the control value, as a server would send it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut inner = vec![];
        if let Some(warning) = self.warning {
            let (id, value) = match warning {
                PasswordWarning::TimeBeforeExpiration(secs) => (0, secs),
                PasswordWarning::GraceLogins(logins) => (1, logins),
            };
            inner.push(Tag::Sequence(Sequence {
                id: 0,
                class: TagClass::Context,
                inner: vec![Tag::Integer(Integer {
                    id,
                    class: TagClass::Context,
                    inner: value as i64,
                })],
            }));
        }
        if let Some(error) = self.error {
            inner.push(Tag::Enumerated(Enumerated {
                id: 1,
                class: TagClass::Context,
                inner: error.code() as i64,
            }));
        }
        let mut buf = BytesMut::new();
        let seq = Tag::Sequence(Sequence {
            inner,
            ..Default::default()
        });
        write::encode_into(&mut buf, seq.into_structure())?;
        Ok(buf.to_vec())
    }
}

impl<F: ConnectionFactory + 'static> Pool<PoolableConnectionFactory<F>> {
    /// Check a password by binding as `dn` on a pooled connection, with the
    /// password policy control.
    ///
    /// On success, returns the password policy warning, if the server sent
    /// one. A rejected Bind is `PasswordRejected`, with the policy error
    /// reported by the server. Either way, the connection is bound again with
    /// the pool's credentials before it's released.
    pub fn authenticate(&self, dn: &str, password: &str) -> Result<Option<PasswordWarning>> {
        let mut conn = self.borrow()?;
        let outcome = conn
            .with_controls(RawControl::from(PasswordPolicy))
            .simple_bind(dn, password);
        if let Err(e) = self.manager().restore_identity(&mut conn) {
            warn!("restoring the identity of connection {} failed: {}", conn.id(), e);
        }
        let result = outcome?;
        let policy = PasswordPolicyResponse::from_controls(&result.ctrls)?.unwrap_or_default();
        if result.rc != 0 {
            return Err(LdapError::PasswordRejected {
                result,
                policy_error: policy.error,
            });
        }
        if let Some(error) = policy.error {
            debug!("bind as {} succeeded with password policy error: {}", dn, error);
        }
        Ok(policy.warning)
    }
}
