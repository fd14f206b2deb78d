
use std::io::Write;
use std::time::Duration;
use test_util::{
    BOUNDARY, FormPart, PAGE_404, NO_THREADS_NOTICE, TestServer, form_body, png_bytes,
    post_request, read_for, read_to_end, split_response,
};

#[test]
fn unknown_route_gets_the_404_page() {
    let server = TestServer::start();
    let response = server.exchange("GET /404 HTTP/1.0\r\n\r\n");
    let (head, body) = split_response(&response);
    assert!(head.starts_with("HTTP/1.0 404 NOT FOUND\r\n"), "{head}");
    assert!(
        head.contains("Content-Type: text/html; charset=utf-8"),
        "{head}"
    );
    assert!(head.contains("Connection: close"), "{head}");
    assert_eq!(body, PAGE_404);
}

#[test]
fn catalog_with_no_threads_shows_the_notice() {
    let server = TestServer::start();
    for path in ["/catalog", "/"] {
        let response = server.exchange(format!("GET {path} HTTP/1.0\r\n\r\n"));
        let (head, body) = split_response(&response);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
        assert!(body.contains(NO_THREADS_NOTICE), "{body}");
    }
}

#[test]
fn ok_response_head_has_the_documented_wire_shape() {
    let server = TestServer::start();
    let response = server.exchange("GET /catalog HTTP/1.0\r\n\r\n");
    let (head, body) = split_response(&response);
    let expected_prefix = format!(
        "HTTP/1.0 200 OK\r\n\
         Server: UwU\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        body.len()
    );
    assert_eq!(format!("{head}\r\n"), expected_prefix);
}

fn location_of(response: &str) -> &str {
    response
        .lines()
        .find_map(|line| line.strip_prefix("Location: "))
        .expect("response carries no Location header")
        .trim_end()
}

fn create_thread(server: &TestServer, subject: &str, comment: &[u8]) -> u64 {
    let png = png_bytes(150);
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "subject",
                content_type: None,
                value: subject.as_bytes(),
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: comment,
            },
            FormPart {
                name: "file",
                content_type: Some("image/png"),
                value: &png,
            },
        ],
    );
    let response = server.exchange(post_request(BOUNDARY, &body));
    assert!(
        response.starts_with("HTTP/1.0 303 SEE OTHER\r\n"),
        "{response}"
    );
    let location = location_of(&response);
    let (_, id) = location.rsplit_once("/thread/").expect(location);
    id.parse().unwrap()
}

#[test]
fn post_creates_a_thread() {
    let server = TestServer::start();
    let thread_id = create_thread(&server, "Hello", b"hi\nworld");

    let catalog = server.exchange("GET /catalog HTTP/1.0\r\n\r\n");
    assert!(catalog.contains("Hello"), "{catalog}");
    assert!(!catalog.contains(NO_THREADS_NOTICE), "{catalog}");

    let thread = server.exchange(format!("GET /thread/{thread_id} HTTP/1.0\r\n\r\n"));
    assert!(thread.starts_with("HTTP/1.0 200 OK\r\n"), "{thread}");
    assert!(thread.contains("hi<br>world"), "{thread}");

    let filenames: Vec<String> = std::fs::read_dir(server.uploads_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name != "deleted")
        .collect();
    assert_eq!(filenames.len(), 1, "{filenames:?}");
    let filename = &filenames[0];
    assert_eq!(filename.len(), 24, "{filename}");
    assert!(filename.ends_with(".png"), "{filename}");
    assert!(
        filename[..20].bytes().all(|b| b.is_ascii_uppercase()),
        "{filename}"
    );
    assert!(thread.contains(filename.as_str()), "{thread}");

    let image = server.exchange_bytes(format!("GET /uploads/{filename} HTTP/1.0\r\n\r\n"));
    let head_end = image.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = std::str::from_utf8(&image[..head_end]).unwrap();
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: image/png\r\n"), "{head}");
    assert!(head.contains("Content-Length: 150\r\n"), "{head}");
    assert_eq!(&image[head_end..], png_bytes(150).as_slice());
}

#[test]
fn replies_redirect_with_a_fragment() {
    let server = TestServer::start();
    let thread_id = create_thread(&server, "Replies", b"first");
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "thread_id",
                content_type: None,
                value: thread_id.to_string().as_bytes(),
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: b"the reply",
            },
        ],
    );
    let response = server.exchange(post_request(BOUNDARY, &body));
    assert!(
        response.starts_with("HTTP/1.0 303 SEE OTHER\r\n"),
        "{response}"
    );
    let location = location_of(&response);
    let (prefix, fragment) = location.rsplit_once('#').expect(location);
    assert!(prefix.ends_with(&format!("/thread/{thread_id}")), "{location}");
    let reply_id: u64 = fragment.parse().unwrap();
    assert!(reply_id > thread_id);

    let thread = server.exchange(format!("GET /thread/{thread_id} HTTP/1.0\r\n\r\n"));
    assert!(thread.contains("the reply"), "{thread}");
}

#[test]
fn reporting_a_thread_deletes_it_and_retires_the_upload() {
    let server = TestServer::start();
    let thread_id = create_thread(&server, "Doomed", b"delete me");
    let response = server.exchange(format!(
        "GET /report?post_id={thread_id} HTTP/1.0\r\n\r\n"
    ));
    assert!(
        response.starts_with("HTTP/1.0 303 SEE OTHER\r\n"),
        "{response}"
    );
    assert_eq!(location_of(&response), "/");

    let catalog = server.exchange("GET /catalog HTTP/1.0\r\n\r\n");
    assert!(catalog.contains(NO_THREADS_NOTICE), "{catalog}");
    let thread = server.exchange(format!("GET /thread/{thread_id} HTTP/1.0\r\n\r\n"));
    assert!(thread.starts_with("HTTP/1.0 404 NOT FOUND\r\n"), "{thread}");

    let deleted: Vec<_> = std::fs::read_dir(server.uploads_dir().join("deleted"))
        .unwrap()
        .collect();
    assert_eq!(deleted.len(), 1);
    let remaining: Vec<_> = std::fs::read_dir(server.uploads_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name != "deleted")
        .collect();
    assert!(remaining.is_empty(), "{remaining:?}");
}

#[test]
fn reporting_a_reply_hides_it() {
    let server = TestServer::start();
    let thread_id = create_thread(&server, "Hide one", b"op stays");
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "thread_id",
                content_type: None,
                value: thread_id.to_string().as_bytes(),
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: b"rude reply",
            },
        ],
    );
    let response = server.exchange(post_request(BOUNDARY, &body));
    let reply_id: u64 = location_of(&response)
        .rsplit_once('#')
        .unwrap()
        .1
        .parse()
        .unwrap();

    server.exchange(format!("GET /report?post_id={reply_id} HTTP/1.0\r\n\r\n"));
    let thread = server.exchange(format!("GET /thread/{thread_id} HTTP/1.0\r\n\r\n"));
    assert!(thread.contains("op stays"), "{thread}");
    assert!(!thread.contains("rude reply"), "{thread}");
}

#[test]
fn invalid_posts_get_a_400() {
    let server = TestServer::start();
    // Thread creation without a file.
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "subject",
                content_type: None,
                value: b"No file",
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: b"missing the image",
            },
        ],
    );
    let response = server.exchange(post_request(BOUNDARY, &body));
    assert!(
        response.starts_with("HTTP/1.0 400 BAD REQUEST\r\n"),
        "{response}"
    );
    // An upload that fails the signature check.
    let mut fake = png_bytes(150);
    fake[0] = 0x00;
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "subject",
                content_type: None,
                value: b"Bad png",
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: b"sig check",
            },
            FormPart {
                name: "file",
                content_type: Some("image/png"),
                value: &fake,
            },
        ],
    );
    let response = server.exchange(post_request(BOUNDARY, &body));
    assert!(
        response.starts_with("HTTP/1.0 400 BAD REQUEST\r\n"),
        "{response}"
    );
}

#[test]
fn oversized_content_length_is_refused_before_the_body() {
    let server = TestServer::start();
    let request = format!(
        "POST /post HTTP/1.0\r\n\
         Content-Type: multipart/form-data; boundary={BOUNDARY}\r\n\
         Content-Length: {}\r\n\r\n",
        5 * 1024 * 1024 + 1
    );
    let response = server.exchange(request);
    assert!(
        response.starts_with("HTTP/1.0 400 BAD REQUEST\r\n"),
        "{response}"
    );
}

#[test]
fn unsupported_method_gets_a_400() {
    let server = TestServer::start();
    let response = server.exchange("PUT / HTTP/1.0\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.0 400 BAD REQUEST\r\n"),
        "{response}"
    );
}

#[test]
fn slow_header_delivery_yields_the_same_response() {
    let server = TestServer::start();
    let fast = server.exchange("GET /404 HTTP/1.0\r\n\r\n");
    let mut stream = server.connect();
    for byte in b"GET /404 HTTP/1.0\r\n\r\n" {
        stream.write_all(&[*byte]).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let slow = String::from_utf8(read_to_end(&mut stream)).unwrap();
    assert_eq!(fast, slow);
}

#[test]
fn head_gets_headers_only_with_the_true_length() {
    let server = TestServer::start();
    let get = server.exchange("GET /catalog HTTP/1.0\r\n\r\n");
    let (_, get_body) = split_response(&get);
    let head = server.exchange("HEAD /catalog HTTP/1.0\r\n\r\n");
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
    assert!(head.ends_with("\r\n\r\n"), "{head}");
    let (head_head, head_body) = split_response(&head);
    assert_eq!(head_body, "");
    assert!(
        head_head.contains(&format!("Content-Length: {}\r\n", get_body.len())),
        "{head_head}"
    );
}

#[test]
fn full_slots_defer_accepts_until_one_closes() {
    let server = TestServer::start_with_slots(2);
    let idle_one = server.connect();
    let _idle_two = server.connect();
    // Give the poll loop a moment to seat both connections.
    std::thread::sleep(Duration::from_millis(150));

    let mut third = server.connect();
    third.write_all(b"GET /404 HTTP/1.0\r\n\r\n").unwrap();
    let early = read_for(&mut third, 300);
    assert!(early.is_empty(), "got a response with no free slot");

    drop(idle_one);
    let response = String::from_utf8(read_to_end(&mut third)).unwrap();
    assert!(
        response.starts_with("HTTP/1.0 404 NOT FOUND\r\n"),
        "{response}"
    );
}

#[test]
fn body_split_across_reads_is_reassembled() {
    let server = TestServer::start();
    let png = png_bytes(150);
    let body = form_body(
        BOUNDARY,
        &[
            FormPart {
                name: "subject",
                content_type: None,
                value: b"Split body",
            },
            FormPart {
                name: "comment",
                content_type: None,
                value: b"sent in pieces",
            },
            FormPart {
                name: "file",
                content_type: Some("image/png"),
                value: &png,
            },
        ],
    );
    let request = post_request(BOUNDARY, &body);
    let mut stream = server.connect();
    for chunk in request.chunks(80) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    let response = String::from_utf8(read_to_end(&mut stream)).unwrap();
    assert!(
        response.starts_with("HTTP/1.0 303 SEE OTHER\r\n"),
        "{response}"
    );
}
