//! Content negotiation.
//!
//! [`negotiate`] is a pure function: it reads the request and response headers
//! and returns the chosen encodings together with the header changes they
//! imply. Nothing is mutated until the caller applies the [`Negotiation`].

use crate::encoding::Encoding;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

const ACCEPT_ENCODING_VALUE: &str = "accept-encoding";

/// A single change to a header map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderPatch {
    Set(HeaderName, HeaderValue),
    Remove(HeaderName),
}

impl HeaderPatch {
    pub fn apply(&self, headers: &mut HeaderMap) {
        match self {
            HeaderPatch::Set(name, value) => {
                headers.insert(name.clone(), value.clone());
            }
            HeaderPatch::Remove(name) => {
                headers.remove(name);
            }
        }
    }
}

/// The outcome of content negotiation for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    encoding_in: Encoding,
    encoding_out: Encoding,
    patches: Vec<HeaderPatch>,
}

impl Negotiation {
    /// The encoding the origin body currently has.
    pub fn encoding_in(&self) -> Encoding {
        self.encoding_in
    }

    /// The encoding the client will receive.
    pub fn encoding_out(&self) -> Encoding {
        self.encoding_out
    }

    pub fn patches(&self) -> &[HeaderPatch] {
        &self.patches
    }

    /// Applies the `vary` and `content-encoding` changes to the response headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for patch in &self.patches {
            patch.apply(headers);
        }
    }
}

/// Chooses input and output encodings for a response.
///
/// Media types whose primary token is `audio`, `image` or `video` are never
/// re-compressed. In fast mode a gzip body is not upgraded to brotli.
pub fn negotiate(request: &HeaderMap, response: &HeaderMap, fast: bool) -> Negotiation {
    let encoding_in = header_str(response, &CONTENT_ENCODING).map_or(Encoding::Identity, Encoding::from_token);

    let encoding_out = if is_incompressible_media(response) {
        Encoding::Identity
    } else {
        let accept = header_str(request, &ACCEPT_ENCODING).unwrap_or("");
        Encoding::detect(accept, fast && encoding_in == Encoding::Gzip)
    };

    debug!(encoding_in = %encoding_in, encoding_out = %encoding_out, fast, "negotiated response encoding");

    let patches = vec![vary_patch(), encoding_out.header_patch()];
    Negotiation { encoding_in, encoding_out, patches }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn is_incompressible_media(response: &HeaderMap) -> bool {
    let Some(content_type) = header_str(response, &CONTENT_TYPE) else {
        return false;
    };

    let primary = content_type.split('/').next().unwrap_or("").trim();
    [mime::AUDIO, mime::IMAGE, mime::VIDEO].iter().any(|name| primary.eq_ignore_ascii_case(name.as_str()))
}

/// The body depends on `accept-encoding` even when nothing is transformed.
fn vary_patch() -> HeaderPatch {
    HeaderPatch::Set(VARY, HeaderValue::from_static(ACCEPT_ENCODING_VALUE))
}
