//! HTTP parsing utilities
//!
//! Shared by the content server, the content fetch client and the
//! gateway's SOAP exchanges. Only the handful of constructs those
//! exchanges actually produce are handled: header blocks, status lines,
//! Content-Length, and the two response shapes quay emits (a plain-text
//! refusal and an octet-stream of known length).

/// Find the end of the header block: the position just past the first
/// blank line. Bare `\n\n` separators (curl sends them) are accepted
/// alongside `\r\n\r\n`.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    for (i, _) in data.iter().enumerate().filter(|(_, b)| **b == b'\n') {
        let rest = &data[i + 1..];
        if rest.starts_with(b"\r\n") {
            return Some(i + 3);
        }
        if rest.first() == Some(&b'\n') {
            return Some(i + 2);
        }
    }
    None
}

/// Parse the status code out of an HTTP status line like `HTTP/1.1 200 OK`.
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Case-insensitive lookup of a header value in a raw header block.
pub fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.lines() {
        if let Some(colon) = line.find(':') {
            if line[..colon].trim().eq_ignore_ascii_case(name) {
                return Some(line[colon + 1..].trim());
            }
        }
    }
    None
}

/// Parse Content-Length from a raw header block. Absence means no body.
pub fn parse_content_length(headers: &str) -> usize {
    header_value(headers, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Status line and headers announcing `length` bytes of `content_type`.
fn response_head(status: u16, content_type: &str, length: u64) -> String {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        500 => "Internal Server Error",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, reason, content_type, length
    )
}

/// A complete plain-text response, used for refusals and failures.
pub fn text_response(status: u16, body: &str) -> String {
    format!(
        "{}{}",
        response_head(status, "text/plain", body.len() as u64),
        body
    )
}

/// Headers for a raw byte stream of known length; the caller streams
/// the body itself.
pub fn stream_head(length: u64) -> String {
    response_head(200, "application/octet-stream", length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\n\nbody"), Some(16));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_header_end(b""), None);
    }

    #[test]
    fn test_find_header_end_takes_first_blank_line() {
        // the second terminator belongs to the body
        assert_eq!(find_header_end(b"a: 1\n\nx\r\n\r\n"), Some(6));
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.0 500 Internal Server Error"), Some(500));
        assert_eq!(parse_status_line("NOTHTTP 200 OK"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[test]
    fn test_header_value_case_insensitive() {
        let headers = "HTTP/1.1 200 OK\r\nLOCATION: http://192.168.1.1:5000/desc.xml\r\nServer: test\r\n";
        assert_eq!(
            header_value(headers, "location"),
            Some("http://192.168.1.1:5000/desc.xml")
        );
        assert_eq!(header_value(headers, "Server"), Some("test"));
        assert_eq!(header_value(headers, "missing"), None);
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("Content-Length: 42\r\n"), 42);
        assert_eq!(parse_content_length("content-length:7\r\n"), 7);
        assert_eq!(parse_content_length("Server: x\r\n"), 0);
    }

    #[test]
    fn test_text_response_shape() {
        let resp = text_response(400, "bad header");
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(resp.contains("Content-Type: text/plain\r\n"));
        assert!(resp.contains("Content-Length: 10\r\n"));
        assert!(resp.ends_with("\r\n\r\nbad header"));
    }

    #[test]
    fn test_stream_head_shape() {
        let head = stream_head(1234);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/octet-stream\r\n"));
        assert!(head.contains("Content-Length: 1234\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_both_shapes_share_one_head() {
        // the stream head is the text head with a different body type
        let text = text_response(200, "");
        let stream = stream_head(0);
        assert_eq!(
            text.replace("text/plain", "application/octet-stream"),
            stream
        );
    }
}
