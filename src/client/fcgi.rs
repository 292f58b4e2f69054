//! Minimal FastCGI client speaking the responder role over TCP.
//!
//! One application request is in flight per connection at a time, so the
//! fixed request id 1 is sufficient; connections are kept open across
//! requests via the keep-conn flag.

use std::borrow::Cow;

use http::response::Parts;
use http::{Request, Response, StatusCode};
use hyper::body::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client::conn::{Exchange, ResponseBody};
use crate::client::RequestError;
use crate::utils::monotonic_nanos;

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;
const REQUEST_ID: u16 = 1;
const MAX_CONTENT: usize = 0xFFFF;

/// One FastCGI connection to the application server.
pub(crate) struct FcgiConnection {
    stream: TcpStream,
    server_name: String,
    server_port: u16,
}

impl FcgiConnection {
    pub(crate) fn new(stream: TcpStream, server_name: String, server_port: u16) -> Self {
        Self {
            stream,
            server_name,
            server_port,
        }
    }

    pub(crate) async fn send(
        &mut self,
        request: &Request<Bytes>,
    ) -> Result<Exchange, RequestError> {
        let mut out = Vec::with_capacity(512 + request.body().len());
        write_record(&mut out, FCGI_BEGIN_REQUEST, &begin_request_body());
        let params = encode_params(request, &self.server_name, self.server_port);
        write_record(&mut out, FCGI_PARAMS, &params);
        write_record(&mut out, FCGI_PARAMS, &[]);
        if !request.body().is_empty() {
            write_record(&mut out, FCGI_STDIN, request.body());
        }
        write_record(&mut out, FCGI_STDIN, &[]);
        self.stream.write_all(&out).await?;

        let mut stdout = Vec::new();
        let mut response_begin_nanos = None;
        loop {
            let (record_type, content) = self.read_record().await?;
            match record_type {
                FCGI_STDOUT => {
                    if response_begin_nanos.is_none() && !content.is_empty() {
                        response_begin_nanos = Some(monotonic_nanos());
                    }
                    stdout.extend_from_slice(&content);
                }
                FCGI_STDERR => {
                    if !content.is_empty() {
                        debug!(
                            stderr = %String::from_utf8_lossy(&content),
                            "application wrote to FastCGI stderr"
                        );
                    }
                }
                FCGI_END_REQUEST => break,
                // Unknown record types are skipped, as the protocol allows.
                _ => {}
            }
        }

        let (parts, body) = parse_cgi_response(&stdout)?;
        Ok(Exchange {
            parts,
            response_begin_nanos: response_begin_nanos.unwrap_or_else(monotonic_nanos),
            body: ResponseBody::Ready(body),
        })
    }

    async fn read_record(&mut self) -> Result<(u8, Vec<u8>), RequestError> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        if header[0] != FCGI_VERSION {
            return Err(RequestError::Fcgi(Cow::Borrowed("unsupported version")));
        }
        let record_type = header[1];
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6] as usize;

        let mut content = vec![0u8; content_length + padding_length];
        self.stream.read_exact(&mut content).await?;
        content.truncate(content_length);
        Ok((record_type, content))
    }
}

fn begin_request_body() -> [u8; 8] {
    let role = FCGI_RESPONDER.to_be_bytes();
    [role[0], role[1], FCGI_KEEP_CONN, 0, 0, 0, 0, 0]
}

/// Emit `content` as one or more records of `record_type`. Empty content
/// still produces one empty record, which terminates a stream.
fn write_record(out: &mut Vec<u8>, record_type: u8, content: &[u8]) {
    if content.is_empty() {
        emit_record(out, record_type, &[]);
        return;
    }
    for chunk in content.chunks(MAX_CONTENT) {
        emit_record(out, record_type, chunk);
    }
}

fn emit_record(out: &mut Vec<u8>, record_type: u8, content: &[u8]) {
    out.push(FCGI_VERSION);
    out.push(record_type);
    out.extend_from_slice(&REQUEST_ID.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(0); // padding length
    out.push(0); // reserved
    out.extend_from_slice(content);
}

fn encode_params(request: &Request<Bytes>, server_name: &str, server_port: u16) -> Vec<u8> {
    let mut params = Vec::with_capacity(256);
    let path = request.uri().path();
    let query = request.uri().query().unwrap_or("");

    push_param(&mut params, "GATEWAY_INTERFACE", "CGI/1.1");
    push_param(&mut params, "REQUEST_METHOD", request.method().as_str());
    push_param(&mut params, "SCRIPT_NAME", path);
    push_param(&mut params, "REQUEST_URI", path);
    push_param(&mut params, "QUERY_STRING", query);
    push_param(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
    push_param(&mut params, "SERVER_NAME", server_name);
    push_param(&mut params, "SERVER_PORT", &server_port.to_string());
    if !request.body().is_empty() {
        push_param(
            &mut params,
            "CONTENT_LENGTH",
            &request.body().len().to_string(),
        );
    }

    for (name, value) in request.headers() {
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let mut cgi_name = String::with_capacity(5 + name.as_str().len());
        cgi_name.push_str("HTTP_");
        for c in name.as_str().chars() {
            match c {
                '-' => cgi_name.push('_'),
                c => cgi_name.push(c.to_ascii_uppercase()),
            }
        }
        push_param(&mut params, &cgi_name, value);
    }

    params
}

fn push_param(buf: &mut Vec<u8>, name: &str, value: &str) {
    push_length(buf, name.len());
    push_length(buf, value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Name-value length encoding: one byte below 128, otherwise four bytes
/// with the high bit set.
fn push_length(buf: &mut Vec<u8>, length: usize) {
    if length < 128 {
        buf.push(length as u8);
    } else {
        buf.extend_from_slice(&((length as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Parse the CGI response accumulated on stdout: a header block terminated
/// by a blank line, an optional `Status` pseudo-header, then the body.
fn parse_cgi_response(raw: &[u8]) -> Result<(Parts, Bytes), RequestError> {
    let (head, body_start) = split_head(raw)
        .ok_or(RequestError::Fcgi(Cow::Borrowed("missing header block")))?;

    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    for line in head.split(|&b| b == b'\n') {
        let line = trim_ascii(line);
        if line.is_empty() {
            continue;
        }
        let mut split = line.splitn(2, |&b| b == b':');
        let name = trim_ascii(split.next().unwrap_or(&[]));
        let value = trim_ascii(split.next().unwrap_or(&[]));
        if name.eq_ignore_ascii_case(b"status") {
            let code = value.split(|&b| b == b' ').next().unwrap_or(&[]);
            let code = std::str::from_utf8(code)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or(RequestError::Fcgi(Cow::Borrowed("invalid status")))?;
            status = StatusCode::from_u16(code)
                .map_err(|_| RequestError::Fcgi(Cow::Borrowed("invalid status")))?;
        } else {
            builder = builder.header(name, value);
        }
    }

    let response = builder
        .status(status)
        .body(())
        .map_err(|_| RequestError::Fcgi(Cow::Borrowed("invalid response header")))?;
    let (parts, _) = response.into_parts();
    Ok((parts, Bytes::copy_from_slice(&raw[body_start..])))
}

/// Locate the blank line ending the header block. Returns the head slice
/// and the offset of the first body byte.
fn split_head(raw: &[u8]) -> Option<(&[u8], usize)> {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return Some((&raw[..pos], pos + 4));
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return Some((&raw[..pos], pos + 2));
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_encoding_switches_at_128() {
        let mut short = Vec::new();
        push_length(&mut short, 127);
        assert_eq!(short, vec![127]);

        let mut long = Vec::new();
        push_length(&mut long, 128);
        assert_eq!(long, vec![0x80, 0, 0, 128]);
    }

    #[test]
    fn records_carry_the_wire_header() {
        let mut out = Vec::new();
        emit_record(&mut out, FCGI_STDIN, b"abc");
        assert_eq!(
            out,
            vec![FCGI_VERSION, FCGI_STDIN, 0, 1, 0, 3, 0, 0, b'a', b'b', b'c']
        );
    }

    #[test]
    fn empty_content_still_terminates_a_stream() {
        let mut out = Vec::new();
        write_record(&mut out, FCGI_PARAMS, &[]);
        assert_eq!(out.len(), 8);
        assert_eq!(out[1], FCGI_PARAMS);
        assert_eq!(&out[4..6], &[0, 0]);
    }

    #[test]
    fn large_streams_are_chunked() {
        let content = vec![0u8; MAX_CONTENT + 1];
        let mut out = Vec::new();
        write_record(&mut out, FCGI_STDIN, &content);
        // Two records: one full, one single-byte.
        assert_eq!(out.len(), 8 + MAX_CONTENT + 8 + 1);
    }

    #[test]
    fn cgi_status_header_overrides_the_default() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let (parts, body) = parse_cgi_response(raw).unwrap();
        assert_eq!(parts.status, StatusCode::NOT_FOUND);
        assert_eq!(parts.headers["content-type"], "text/plain");
        assert_eq!(&body[..], b"missing");
    }

    #[test]
    fn cgi_response_defaults_to_200() {
        let raw = b"Content-Type: text/html\n\n<html></html>";
        let (parts, body) = parse_cgi_response(raw).unwrap();
        assert_eq!(parts.status, StatusCode::OK);
        assert_eq!(&body[..], b"<html></html>");
    }

    #[test]
    fn headerless_output_is_rejected() {
        assert!(parse_cgi_response(b"no blank line here").is_err());
    }
}
