//! Pseudo-header handling shared by the HTTP/2 and HTTP/3 codecs.
//!
//! Both protocols carry start-line information as `:`-prefixed fields
//! that must precede regular fields and never appear in trailers. The
//! helpers here split decoded field lists back into typed heads and
//! flatten typed heads into encodable field lists.

use bytes::Bytes;

use crate::error::Error;
use crate::http::{fields, BodyLength, FieldSection, Method, Request, Response, Scheme, StatusCode};

/// A decoded peer message head.
#[derive(Debug)]
pub enum PeerHead {
    Request(Request),
    Response(Response),
}

/// Field list ready for HPACK/QPACK encoding: pseudo fields first.
pub type FieldList = Vec<(Vec<u8>, Vec<u8>, bool)>;

/// Flattens a request head into an encodable field list.
///
/// The `host` field is dropped in favor of `:authority`;
/// `authorization` values ride as sensitive.
#[must_use]
pub fn request_fields(request: &Request) -> FieldList {
    let mut list: FieldList = vec![
        (b":method".to_vec(), request.method.as_str().as_bytes().to_vec(), false),
        (b":scheme".to_vec(), request.scheme.as_str().as_bytes().to_vec(), false),
        (b":authority".to_vec(), request.authority.as_bytes().to_vec(), false),
        (b":path".to_vec(), request.target.as_bytes().to_vec(), false),
    ];
    for (name, value) in &request.headers {
        if name.as_str() == "host" {
            continue;
        }
        let sensitive = matches!(name.as_str(), "authorization" | "proxy-authorization" | "cookie");
        list.push((name.as_bytes().to_vec(), value.as_bytes().to_vec(), sensitive));
    }
    list
}

/// Flattens a response head into an encodable field list.
#[must_use]
pub fn response_fields(response: &Response) -> FieldList {
    let mut list: FieldList = vec![(
        b":status".to_vec(),
        response.status.as_u16().to_string().into_bytes(),
        false,
    )];
    for (name, value) in &response.headers {
        let sensitive = name.as_str() == "set-cookie";
        list.push((name.as_bytes().to_vec(), value.as_bytes().to_vec(), sensitive));
    }
    list
}

/// Flattens trailers; pseudo fields cannot occur by construction.
#[must_use]
pub fn trailer_fields(trailers: &FieldSection) -> FieldList {
    trailers
        .iter()
        .map(|(name, value)| (name.as_bytes().to_vec(), value.as_bytes().to_vec(), false))
        .collect()
}

fn split_pseudo(decoded: Vec<(Bytes, Bytes)>) -> Result<(Vec<(Bytes, Bytes)>, FieldSection), Error> {
    let mut pseudo = Vec::new();
    let mut section = FieldSection::new();
    let mut seen_regular = false;

    for (name, value) in decoded {
        if name.starts_with(b":") {
            if seen_regular {
                return Err(Error::MalformedMessage("pseudo-header after regular field".into()));
            }
            if pseudo.iter().any(|(n, _): &(Bytes, Bytes)| n == &name) {
                return Err(Error::MalformedMessage("duplicate pseudo-header".into()));
            }
            pseudo.push((name, value));
        } else {
            seen_regular = true;
            for forbidden in fields::CONNECTION_SPECIFIC {
                if name.as_ref() == forbidden.as_bytes() {
                    return Err(Error::MalformedMessage(format!(
                        "connection-specific field {forbidden} is forbidden here"
                    )));
                }
            }
            // `te` survives only as `te: trailers`.
            if name.as_ref() == b"te" && value.as_ref() != b"trailers" {
                return Err(Error::MalformedMessage("te other than trailers".into()));
            }
            section.try_append(&name, value)?;
        }
    }
    Ok((pseudo, section))
}

fn pseudo_value(pseudo: &[(Bytes, Bytes)], name: &[u8]) -> Option<Bytes> {
    pseudo
        .iter()
        .find(|(n, _)| n.as_ref() == name)
        .map(|(_, v)| v.clone())
}

/// Rebuilds a request head from a decoded field list.
pub fn split_request(decoded: Vec<(Bytes, Bytes)>) -> Result<PeerHead, Error> {
    let (pseudo, mut headers) = split_pseudo(decoded)?;
    for (name, _) in &pseudo {
        if !matches!(name.as_ref(), b":method" | b":scheme" | b":authority" | b":path") {
            return Err(Error::MalformedMessage("unknown request pseudo-header".into()));
        }
    }
    let method: Method = std::str::from_utf8(
        &pseudo_value(&pseudo, b":method")
            .ok_or_else(|| Error::MalformedMessage("missing :method".into()))?,
    )
    .map_err(|_| Error::MalformedMessage("non-ascii :method".into()))?
    .parse()?;
    let scheme = match pseudo_value(&pseudo, b":scheme")
        .ok_or_else(|| Error::MalformedMessage("missing :scheme".into()))?
        .as_ref()
    {
        b"https" => Scheme::Https,
        b"http" => Scheme::Http,
        other => {
            return Err(Error::MalformedMessage(format!(
                "unsupported scheme {:?}",
                String::from_utf8_lossy(other)
            )));
        }
    };
    let path = pseudo_value(&pseudo, b":path")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::MalformedMessage("missing :path".into()))?;
    let authority = pseudo_value(&pseudo, b":authority").unwrap_or_default();

    // H1-shaped handlers expect a host field; synthesize it.
    if !headers.contains("host") && !authority.is_empty() {
        headers.try_append(b"host", authority.clone())?;
    }

    Ok(PeerHead::Request(Request {
        method,
        target: String::from_utf8(path.to_vec())
            .map_err(|_| Error::MalformedMessage("non-utf8 :path".into()))?,
        scheme,
        authority: String::from_utf8_lossy(&authority).into_owned(),
        headers,
        trailers: FieldSection::new(),
        body: BodyLength::None,
    }))
}

/// Rebuilds a response head from a decoded field list.
pub fn split_response(decoded: Vec<(Bytes, Bytes)>) -> Result<PeerHead, Error> {
    let (pseudo, headers) = split_pseudo(decoded)?;
    for (name, _) in &pseudo {
        if name.as_ref() != b":status" {
            return Err(Error::MalformedMessage("unknown response pseudo-header".into()));
        }
    }
    let status = pseudo_value(&pseudo, b":status")
        .ok_or_else(|| Error::MalformedMessage("missing :status".into()))?;
    let status = std::str::from_utf8(&status)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::MalformedMessage("malformed :status".into()))?;
    let mut response = Response::new(StatusCode::new(status)?);
    response.headers = headers;
    Ok(PeerHead::Response(response))
}

/// Validates a trailer field list: pseudo fields are forbidden.
pub fn split_trailers(decoded: Vec<(Bytes, Bytes)>) -> Result<FieldSection, Error> {
    let (pseudo, section) = split_pseudo(decoded)?;
    if !pseudo.is_empty() {
        return Err(Error::MalformedMessage("pseudo-header in trailers".into()));
    }
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> Vec<(Bytes, Bytes)> {
        pairs
            .iter()
            .map(|(n, v)| (Bytes::copy_from_slice(n.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[test]
    fn request_head_round_trip() {
        let decoded = raw(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/q"),
            ("accept", "*/*"),
        ]);
        let PeerHead::Request(request) = split_request(decoded).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.target, "/q");
        assert_eq!(request.headers.get("host").unwrap().as_bytes(), b"example.com");
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let decoded = raw(&[(":method", "GET"), ("accept", "*/*"), (":path", "/")]);
        assert!(split_request(decoded).is_err());
    }

    #[test]
    fn connection_specific_fields_are_malformed() {
        let decoded = raw(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "h"),
            (":path", "/"),
            ("transfer-encoding", "chunked"),
        ]);
        assert!(split_request(decoded).is_err());
    }

    #[test]
    fn trailers_refuse_pseudo_fields() {
        assert!(split_trailers(raw(&[(":status", "200")])).is_err());
        let section = split_trailers(raw(&[("x-sum", "1")])).unwrap();
        assert_eq!(section.len(), 1);
    }

    #[test]
    fn sensitive_request_fields_are_flagged() {
        let mut request = Request::get("h", "/");
        request.headers.try_append(b"authorization", "Bearer x").unwrap();
        request.headers.try_append(b"accept", "*/*").unwrap();
        let list = request_fields(&request);
        let auth = list.iter().find(|(n, _, _)| n == b"authorization").unwrap();
        assert!(auth.2);
        let accept = list.iter().find(|(n, _, _)| n == b"accept").unwrap();
        assert!(!accept.2);
    }
}
