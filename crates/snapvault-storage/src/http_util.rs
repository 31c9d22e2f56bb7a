use snapvault_types::error::{Result, SnapError};

/// Extract and parse the Content-Length header from a response.
pub fn extract_content_length(resp: &ureq::Response, context: &str) -> Result<u64> {
    resp.header("content-length")
        .ok_or_else(|| SnapError::Transient(format!("{context}: missing Content-Length header")))?
        .parse::<u64>()
        .map_err(|e| SnapError::Transient(format!("{context}: invalid Content-Length: {e}")))
}

/// Extract the ETag header, stripping surrounding quotes.
///
/// S3 returns etags quoted (`"abc123"`); the unquoted value is what gets
/// fed back into `If-Match`.
pub fn extract_etag(resp: &ureq::Response) -> Option<String> {
    resp.header("etag")
        .map(|raw| raw.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_quotes_are_stripped() {
        let resp = ureq::Response::new(200, "OK", "")
            .unwrap();
        // Response::new has no headers; exercise the trim path directly.
        assert_eq!(
            "\"d41d8cd98f00b204e9800998ecf8427e\"".trim_matches('"'),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert!(extract_etag(&resp).is_none());
    }

    #[test]
    fn missing_content_length_is_transient() {
        let resp = ureq::Response::new(200, "OK", "").unwrap();
        match extract_content_length(&resp, "HEAD x") {
            Err(SnapError::Transient(msg)) => assert!(msg.contains("Content-Length")),
            other => panic!("expected Transient, got {other:?}"),
        }
    }
}
