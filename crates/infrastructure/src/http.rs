use tracing::debug;

use linkmux_core::codes;
use linkmux_core::traits::{HttpParse, ShortLinkCodec};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// HTTP/1.1 `POST` with `Connection: close`. The response body is delimited
/// by `Content-Length` when present, otherwise by the peer closing.
#[derive(Debug, Clone)]
pub struct SimpleHttpCodec {
    user_agent: String,
    content_type: String,
}

impl Default for SimpleHttpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleHttpCodec {
    pub fn new() -> Self {
        Self {
            user_agent: format!("linkmux/{}", env!("CARGO_PKG_VERSION")),
            content_type: "application/octet-stream".to_string(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_status_line(line: &str) -> Option<i32> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn content_length<'a>(mut headers: impl Iterator<Item = &'a str>) -> Option<usize> {
    headers.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}

impl ShortLinkCodec for SimpleHttpCodec {
    fn pack(&self, host: &str, cgi: &str, body: &[u8], _ext: &[u8]) -> Vec<u8> {
        let mut request = format!(
            "POST {cgi} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {}\r\nAccept: */*\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.user_agent,
            self.content_type,
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        request
    }

    fn parse(&self, buf: &[u8], eof: bool) -> HttpParse {
        let Some(split) = find(buf, HEADER_END) else {
            return if eof {
                HttpParse::Error(codes::HTTP_SPLIT_HEAD_BODY)
            } else {
                HttpParse::NeedMore
            };
        };
        let Ok(head) = std::str::from_utf8(&buf[..split]) else {
            return HttpParse::Error(codes::HTTP_PARSE_STATUS_LINE);
        };
        let mut lines = head.split("\r\n");
        let Some(status) = lines.next().and_then(parse_status_line) else {
            return HttpParse::Error(codes::HTTP_PARSE_STATUS_LINE);
        };

        let body = &buf[split + HEADER_END.len()..];
        match content_length(lines) {
            Some(len) if body.len() >= len => HttpParse::Complete {
                status,
                body: body[..len].to_vec(),
            },
            Some(len) if eof => {
                debug!(expected = len, received = body.len(), "HTTP 响应体不完整");
                HttpParse::Error(codes::HTTP_SPLIT_HEAD_BODY)
            }
            Some(_) => HttpParse::NeedMore,
            None if eof => HttpParse::Complete {
                status,
                body: body.to_vec(),
            },
            None => HttpParse::NeedMore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let request = SimpleHttpCodec::new().pack("api.test", "/cgi-bin/echo", b"abc", b"");
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("POST /cgi-bin/echo HTTP/1.1\r\nHost: api.test\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_content_length_response() {
        let codec = SimpleHttpCodec::new();
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(codec.parse(&response[..30], false), HttpParse::NeedMore);
        assert_eq!(
            codec.parse(response, false),
            HttpParse::Complete {
                status: 200,
                body: b"hello".to_vec()
            }
        );
        assert_eq!(
            codec.parse(&response[..response.len() - 1], true),
            HttpParse::Error(codes::HTTP_SPLIT_HEAD_BODY)
        );
    }

    #[test]
    fn test_body_until_close() {
        let codec = SimpleHttpCodec::new();
        let response = b"HTTP/1.0 302 Found\r\nLocation: /x\r\n\r\nmoved";
        assert_eq!(codec.parse(response, false), HttpParse::NeedMore);
        assert_eq!(
            codec.parse(response, true),
            HttpParse::Complete {
                status: 302,
                body: b"moved".to_vec()
            }
        );
    }

    #[test]
    fn test_malformed_responses() {
        let codec = SimpleHttpCodec::new();
        assert_eq!(
            codec.parse(b"garbage without end", true),
            HttpParse::Error(codes::HTTP_SPLIT_HEAD_BODY)
        );
        assert_eq!(
            codec.parse(b"SPDY nonsense\r\n\r\n", true),
            HttpParse::Error(codes::HTTP_PARSE_STATUS_LINE)
        );
    }
}
