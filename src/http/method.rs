//! Request methods.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// HTTP request method.
///
/// The registered methods are typed; anything else syntactically valid
/// as a token is carried through as `Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Extension(String),
}

impl Method {
    /// Method name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Extension(s) => s,
        }
    }

    /// Idempotent per RFC 9110 §9.2.2; governs transparent retries.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get
                | Method::Head
                | Method::Options
                | Method::Put
                | Method::Delete
                | Method::Trace
        )
    }

    /// Safe per RFC 9110 §9.2.1; governs 0-RTT early-data eligibility.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options | Method::Trace)
    }

    /// True when a request with this method never carries a body by
    /// convention (the engines still honor an explicit length).
    #[must_use]
    pub fn body_unexpected(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Delete | Method::Trace)
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => {
                if other.is_empty() || !other.bytes().all(super::fields::is_token_byte) {
                    return Err(Error::BadSyntax(format!("invalid method {other:?}")));
                }
                Method::Extension(other.to_owned())
            }
        };
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registered_and_extension_methods() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!(
            "PURGE".parse::<Method>().unwrap(),
            Method::Extension("PURGE".into())
        );
        assert!("BAD METHOD".parse::<Method>().is_err());
    }

    #[test]
    fn idempotency_covers_put_and_delete() {
        assert!(Method::Put.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Put.is_safe());
    }
}
