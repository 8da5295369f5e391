//! `multipart/form-data` bodies.

use bytes::{BufMut, Bytes, BytesMut};

use super::content_type::ContentType;

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Form field name from `Content-Disposition`
    pub name: String,
    /// File name, if the part is a file
    pub filename: Option<String>,
    /// Declared content type of the part
    pub content_type: Option<ContentType>,
    /// Part payload
    pub body: Bytes,
}

/// Build a single-part body holding one file.
#[must_use]
pub fn build(part: &Part, boundary: &str) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(format!("--{boundary}\r\n").as_bytes());
    let disposition = match &part.filename {
        Some(filename) => format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n",
            part.name
        ),
        None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name),
    };
    out.put_slice(disposition.as_bytes());
    if let Some(content_type) = &part.content_type {
        out.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(&part.body);
    out.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    out.freeze()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn disposition_param(header: &str, param: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|piece| {
        let (key, value) = piece.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(param)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Split a multipart body into its parts.
///
/// Returns `None` when the body is not delimited by the boundary.
#[must_use]
pub fn parse(body: &[u8], boundary: &str) -> Option<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut pos = find(body, delimiter, 0)? + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[pos..].starts_with(b"--") {
            return Some(parts);
        }
        let header_start = find(body, b"\r\n", pos)? + 2;
        let next = find(body, delimiter, header_start)?;
        // the part ends with the CRLF preceding the next delimiter
        let part_end = next.checked_sub(2).filter(|end| *end >= header_start)?;
        let raw = &body[header_start..part_end];
        let header_end = find(raw, b"\r\n\r\n", 0);
        let (headers, payload) = match header_end {
            Some(end) => (&raw[..end], &raw[end + 4..]),
            None => (&[][..], raw),
        };

        let headers = String::from_utf8_lossy(headers);
        let mut name = String::new();
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(value, "name").unwrap_or_default();
                filename = disposition_param(value, "filename");
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = value.trim().parse().ok();
            }
        }

        parts.push(Part {
            name,
            filename,
            content_type,
            body: Bytes::copy_from_slice(payload),
        });
        pos = next + delimiter.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_parse() {
        let part = Part {
            name: "file".into(),
            filename: Some("logo.png".into()),
            content_type: Some("image/png".parse().unwrap()),
            body: Bytes::from_static(b"\x89PNG\r\n\x1a\nbinary"),
        };
        let body = build(&part, "XyZ");
        let parsed = parse(&body, "XyZ").unwrap();
        assert_eq!(parsed, vec![part]);
    }

    #[test]
    fn test_parse_two_parts() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\none\r\n--b\r\nContent-Disposition: form-data; name=\"c\"\r\nContent-Type: application/json\r\n\r\n{}\r\n--b--\r\n";
        let parts = parse(body, "b").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "a");
        assert_eq!(&parts[0].body[..], b"one");
        assert!(parts[1].content_type.as_ref().unwrap().is_json());
    }

    #[test]
    fn test_wrong_boundary() {
        assert!(parse(b"--b\r\n\r\nx\r\n--b--", "other").is_none());
    }
}
