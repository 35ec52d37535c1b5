//! Parsers for CGI/1.1 responses
//!
//! The same header grammar shows up in multipart bodies, so `headers` is
//! shared with the upload handler.

use crate::cgi::{DocumentHeaders, Header, Status};

use nom::bytes::complete::{tag, take_till, take_while1, take_while_m_n};
use nom::character::complete::{line_ending, space0, space1};
use nom::combinator::{eof, map, map_res, opt, rest};
use nom::multi::{many0, many1};
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;

use std::str;

fn cr_or_lf(x: u8) -> bool {
    x == b'\n' || x == b'\r'
}

/// RFC 7230 `tchar`
fn is_token(x: u8) -> bool {
    match x {
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
        | b'`' | b'|' | b'~' => true,
        _ => x.is_ascii_alphanumeric(),
    }
}

fn trim_trailing_whitespace(mut content: &[u8]) -> &[u8] {
    while let Some((&last, init)) = content.split_last() {
        if last != b' ' && last != b'\t' {
            break;
        }
        content = init;
    }
    content
}

/// One `Name: value` line, with its line ending
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    map(
        tuple((
            take_while1(is_token),
            tag(":"),
            space0,
            terminated(take_till(cr_or_lf), line_ending),
        )),
        |(name, _, _, content): (&[u8], _, _, &[u8])| Header {
            name: Vec::from(name),
            content: Vec::from(trim_trailing_whitespace(content)),
        },
    )(input)
}

/// At least one header, then the blank line that ends the header section.
///
/// LF and CRLF line endings are both accepted, and may be mixed.
pub fn headers(input: &[u8]) -> IResult<&[u8], Vec<Header>> {
    terminated(many1(header), line_ending)(input)
}

/// Like `headers`, but the section may be empty, as in a bare multipart part
pub fn optional_headers(input: &[u8]) -> IResult<&[u8], Vec<Header>> {
    terminated(many0(header), line_ending)(input)
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        map_res(take_while_m_n(3, 3, |x: u8| x.is_ascii_digit()), str::from_utf8),
        str::parse::<u16>,
    )(input)
}

/// The value of a `Status:` header: `NNN [reason]`
pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    map(
        terminated(tuple((code, opt(preceded(space1, rest)))), eof),
        |(code, phrase): (u16, Option<&[u8]>)| Status {
            code: code,
            reason_phrase: phrase.map(Vec::from).unwrap_or_default(),
        },
    )(input)
}

fn is_named(header: &Header, name: &str) -> bool {
    header.name.eq_ignore_ascii_case(name.as_bytes())
}

/// Splits a CGI document into its classified headers and the body.
///
/// `Status`, `Location` and `Content-Type` are pulled out. Framing headers
/// (`Content-Length`, `Transfer-Encoding`) are dropped, since the server
/// recomputes the body length. Everything else is kept in order.
pub fn doc_headers(input: &[u8]) -> IResult<&[u8], DocumentHeaders> {
    let (body, all) = headers(input)?;

    let mut doc = DocumentHeaders {
        content_type: None,
        status: None,
        location: None,
        headers: Vec::with_capacity(all.len()),
    };

    for header in all {
        if is_named(&header, "Status") {
            let (_, parsed) = status(&header.content).map_err(|_| {
                nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit))
            })?;
            doc.status = Some(parsed);
        }
        else if is_named(&header, "Content-Type") {
            doc.content_type = Some(header.content);
        }
        else if is_named(&header, "Location") {
            doc.location = Some(header.content);
        }
        else if is_named(&header, "Content-Length") || is_named(&header, "Transfer-Encoding") {
            continue;
        }
        else {
            doc.headers.push(header);
        }
    }

    Ok((body, doc))
}

#[cfg(test)]
mod test {
    use super::*;

    fn hdr(name: &str, content: &str) -> Header {
        Header {
            name: Vec::from(name.as_bytes()),
            content: Vec::from(content.as_bytes()),
        }
    }

    #[test]
    fn header_works() {
        let input: &[u8] = b"Foo: bar\r\n\r\n";

        match header(input) {
            Ok((rest, res)) => {
                assert_eq!(hdr("Foo", "bar"), res);
                assert_eq!(b"\r\n", rest);
            },
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn header_without_space_or_value() {
        assert_eq!(header(b"X-Empty:\n").map(|(_, h)| h), Ok(hdr("X-Empty", "")));
        assert_eq!(header(b"A:b  \n").map(|(_, h)| h), Ok(hdr("A", "b")));
    }

    #[test]
    fn header_needs_a_colon() {
        assert!(header(b"no colon here\n").is_err());
        assert!(header(b": value\n").is_err());
    }

    #[test]
    fn test_headers() {
        let input: &[u8] = b"Foo: bar\r\nBaz: buz\n\r\nbody";

        match headers(input) {
            Ok((rest, hdrs)) => {
                assert_eq!(vec![hdr("Foo", "bar"), hdr("Baz", "buz")], hdrs);
                assert_eq!(b"body", rest);
            },
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn headers_must_be_terminated() {
        assert!(headers(b"Foo: bar\r\n").is_err());
        assert!(headers(b"just a body").is_err());
        assert!(headers(b"\r\nbody").is_err());
    }

    #[test]
    fn empty_header_section() {
        assert_eq!(optional_headers(b"\r\nbody"), Ok((&b"body"[..], Vec::new())));
        assert!(optional_headers(b"Foo: bar\r\n").is_err());
    }

    #[test]
    fn status_with_and_without_phrase() {
        assert_eq!(status(b"404 Not Found").map(|(_, s)| s), Ok(Status {
            code: 404,
            reason_phrase: Vec::from(&b"Not Found"[..]),
        }));
        assert_eq!(status(b"302").map(|(_, s)| s.code), Ok(302));
        assert!(status(b"abc").is_err());
    }

    #[test]
    fn doc_headers_classifies() {
        let input: &[u8] = b"Status: 201 Created\nContent-Type: text/plain\nContent-Length: 999\n\
                             Set-Cookie: a=1\nSet-Cookie: b=2\nLocation: /x\n\nhello";

        let (body, doc) = doc_headers(input).unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(doc.status.map(|s| s.code), Some(201));
        assert_eq!(doc.content_type, Some(Vec::from(&b"text/plain"[..])));
        assert_eq!(doc.location, Some(Vec::from(&b"/x"[..])));
        assert_eq!(doc.headers, vec![hdr("Set-Cookie", "a=1"), hdr("Set-Cookie", "b=2")]);
    }

    #[test]
    fn doc_headers_rejects_bad_status() {
        assert!(doc_headers(b"Status: teapot\n\n").is_err());
    }
}
