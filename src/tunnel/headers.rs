//! Header classification for tunneled requests and responses.

use hyper::header::HeaderName;
use hyper::HeaderMap;

/// How a header is carried across the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTreatment {
    /// Never forwarded.
    Suppressed,
    /// Describes the body; travels with the content headers.
    ContentSpecific,
    General,
}

const SUPPRESSED_HEADERS: &[&str] = &["host"];

const CONTENT_SPECIFIC_HEADERS: &[&str] = &[
    "allow",
    "content-disposition",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-range",
    "content-type",
    "expires",
    "last-modified",
];

/// Classify a header name, ignoring ASCII case.
pub fn classify(name: &str) -> HeaderTreatment {
    let is = |set: &[&str]| set.iter().any(|h| h.eq_ignore_ascii_case(name));
    if is(SUPPRESSED_HEADERS) {
        HeaderTreatment::Suppressed
    } else if is(CONTENT_SPECIFIC_HEADERS) {
        HeaderTreatment::ContentSpecific
    } else {
        HeaderTreatment::General
    }
}

/// Forwardable headers split into the general and content collections.
#[derive(Debug, Default, Clone)]
pub struct PartitionedHeaders {
    pub general: HeaderMap,
    pub content: HeaderMap,
}

impl PartitionedHeaders {
    /// Split `headers`, dropping suppressed names. Every other value lands in
    /// exactly one collection, keeping name order and repeated values.
    pub fn split(headers: &HeaderMap) -> Self {
        let mut partitioned = Self::default();
        for name in headers.keys() {
            let target = match classify(name.as_str()) {
                HeaderTreatment::Suppressed => continue,
                HeaderTreatment::ContentSpecific => &mut partitioned.content,
                HeaderTreatment::General => &mut partitioned.general,
            };
            for value in headers.get_all(name) {
                target.append(name.clone(), value.clone());
            }
        }
        partitioned
    }

    /// General headers followed by content headers, as written on the wire.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &hyper::header::HeaderValue)> {
        self.general.iter().chain(self.content.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.content.is_empty()
    }
}
