//! Outgoing request description and response header parsing

use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, RANGE};
use url::Url;

use crate::app::transfer::Headers;
use crate::constants::http;
use crate::errors::{TransferError, TransferResult};

/// One GET issued by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: Url,
    /// Client headers, copied verbatim apart from the engine-owned ones
    pub headers: Headers,
    /// Byte offset to resume from; `None` for a fresh download
    pub range_start: Option<u64>,
}

impl TransferRequest {
    pub fn new(url: Url, headers: Headers) -> Self {
        Self {
            url,
            headers,
            range_start: None,
        }
    }

    pub fn with_range(mut self, offset: u64) -> Self {
        self.range_start = Some(offset);
        self
    }

    /// Header map actually sent on the wire
    ///
    /// Client `Range` and `Accept-Encoding` headers are dropped. The encoding
    /// is always `identity` so the bytes on disk are the bytes that were
    /// hashed by the publisher.
    pub fn header_map(&self) -> TransferResult<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if is_engine_header(name) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransferError::validation(format!("Invalid header name: '{}'", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                TransferError::validation(format!("Invalid value for header '{}'", name))
            })?;
            map.append(name, value);
        }
        map.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(http::IDENTITY_ENCODING),
        );
        if let Some(offset) = self.range_start {
            let range = HeaderValue::from_str(&format!("bytes={}-", offset))
                .map_err(|_| TransferError::validation("Invalid range offset"))?;
            map.insert(RANGE, range);
        }
        Ok(map)
    }
}

fn is_engine_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(RANGE.as_str()) || name.eq_ignore_ascii_case(ACCEPT_ENCODING.as_str())
}

/// Reject headers that could never be sent
pub fn validate_headers(headers: &Headers) -> TransferResult<()> {
    let probe = TransferRequest {
        url: Url::parse("http://localhost/").map_err(|e| TransferError::validation(e.to_string()))?,
        headers: headers.clone(),
        range_start: None,
    };
    probe.header_map().map(|_| ())
}

/// Parse and check a download URL
pub fn parse_download_url(raw: &str) -> TransferResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| TransferError::validation(format!("Invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransferError::validation(format!(
            "Unsupported URL scheme '{}' in '{}'",
            other, raw
        ))),
    }
}

/// File name suggested by a `Content-Disposition` header
///
/// Prefers the RFC 5987 `filename*` parameter. Only the last path component
/// is kept so a server cannot steer the file outside its directory.
pub fn content_disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();
        if key == "filename*" {
            // charset'language'percent-encoded
            let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
            extended = Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned());
        } else if key == "filename" {
            plain = Some(raw.trim_matches('"').to_string());
        }
    }
    extended
        .or(plain)
        .map(|name| {
            name.rsplit(['/', '\\'])
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> TransferRequest {
        TransferRequest::new(
            Url::parse("http://example.com/file.bin").unwrap(),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_engine_headers_override_client_headers() {
        let map = request(&[
            ("RANGE", "bytes=10-"),
            ("accept-encoding", "gzip"),
            ("X-Token", "abc"),
        ])
        .header_map()
        .unwrap();

        assert!(map.get(RANGE).is_none());
        assert_eq!(map.get(ACCEPT_ENCODING).unwrap(), "identity");
        assert_eq!(map.get("x-token").unwrap(), "abc");
    }

    #[test]
    fn test_resume_sets_range() {
        let map = request(&[]).with_range(4096).header_map().unwrap();
        assert_eq!(map.get(RANGE).unwrap(), "bytes=4096-");
    }

    #[test]
    fn test_invalid_header_is_validation_error() {
        let mut headers = Headers::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            validate_headers(&headers),
            Err(TransferError::Validation { .. })
        ));
    }

    #[test]
    fn test_parse_download_url() {
        assert!(parse_download_url("https://example.com/a.iso").is_ok());
        assert!(parse_download_url("ftp://example.com/a.iso").is_err());
        assert!(parse_download_url("not a url").is_err());
    }

    #[test]
    fn test_content_disposition_filename() {
        assert_eq!(
            content_disposition_filename("attachment; filename=\"report.pdf\"").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            content_disposition_filename("attachment; filename*=UTF-8''na%C3%AFve.txt; filename=\"naive.txt\"")
                .as_deref(),
            Some("naïve.txt")
        );
        assert_eq!(
            content_disposition_filename("attachment; filename=\"../../etc/passwd\"").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            content_disposition_filename("attachment; filename*=UTF-8''100%25%20done.txt").as_deref(),
            Some("100% done.txt")
        );
        assert_eq!(content_disposition_filename("inline"), None);
    }
}
