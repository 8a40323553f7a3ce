use wicket::http::parser::{ParseError, ParseLimits, parse_http_request, parse_http_request_with};
use wicket::http::request::Method;

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.uri, "/");
    assert_eq!(parsed.version, "HTTP/1.1");
    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_post_request_with_body() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.uri, "/api");
    assert_eq!(parsed.body, b"hello".to_vec());
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_headers_case_insensitive_lookup() {
    let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\n\
        User-Agent: test-client\r\nAccept: */*\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.get("host").unwrap(), "example.com");
    assert_eq!(parsed.headers.get("USER-AGENT").unwrap(), "test-client");
    assert_eq!(parsed.headers.get("Accept").unwrap(), "*/*");
}

#[test]
fn test_parse_repeated_headers_are_kept() {
    let req = b"GET / HTTP/1.1\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.get_all("X-Tag"), vec!["a", "b"]);
}

#[test]
fn test_parse_request_keeps_query_string_in_uri() {
    let req = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.uri, "/search?q=rust");
}

#[test]
fn test_parse_pipelined_requests_consume_one_at_a_time() {
    let req = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
    let (first, consumed) = parse_http_request(req).unwrap();
    let (second, _) = parse_http_request(&req[consumed..]).unwrap();

    assert_eq!(first.uri, "/a");
    assert_eq!(second.uri, "/b");
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_incomplete_request_partial_body() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_invalid_http_method() {
    let req = b"INVALID / HTTP/1.1\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidMethod)));
}

#[test]
fn test_parse_invalid_version() {
    let req = b"GET / HTTP/2.0\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidVersion)));
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_bad_content_length() {
    let req = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
    assert!(matches!(
        parse_http_request(req),
        Err(ParseError::InvalidContentLength)
    ));
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\n\r\n", method_str);
        let (parsed, _) = parse_http_request(req.as_bytes()).unwrap();
        assert_eq!(parsed.method, expected_method);
    }
}

#[test]
fn test_parse_limits_reject_large_headers() {
    let limits = ParseLimits {
        max_header_size: 16,
        ..ParseLimits::default()
    };
    let req = b"GET / HTTP/1.1\r\nX-Long-Header: 0123456789abcdef\r\n\r\n";

    assert!(matches!(
        parse_http_request_with(req, &limits),
        Err(ParseError::TooLarge { what: "header section", limit: 16 })
    ));
}

#[test]
fn test_parse_limits_reject_large_content_length_before_body_arrives() {
    let limits = ParseLimits {
        max_content_length: 4,
        ..ParseLimits::default()
    };
    let req = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n";

    assert!(matches!(
        parse_http_request_with(req, &limits),
        Err(ParseError::TooLarge { what: "request body", limit: 4 })
    ));
}
