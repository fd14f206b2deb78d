use crate::App;
use crate::config::{MAX_BODY_SIZE, SERVER_URL, UPLOAD_MAX_SIZE, UPLOAD_MIN_SIZE};
use crate::forum::{POST_COMMENT_MAX, POST_NAME_MAX, PostDraft, THREAD_SUBJECT_MAX};
use crate::multipart::{BoundField, FieldSpec, UploadKind, parse_form_data};
use crate::request::{Method, Request};
use crate::response::Response;
use crate::template::{render_catalog, render_thread};
use log::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamType {
    Str,
    Integer,
}

/// One entry of a route's query-parameter schema.
#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub key: &'static str,
    pub ty: ParamType,
    pub optional: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamValue<'a> {
    Str(&'a str),
    Integer(i64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundParam<'a> {
    pub key: &'static str,
    pub value: ParamValue<'a>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidParams;

/// Splits the raw query string on `&` and each chunk on `=`, binding
/// values against the schema. String values are borrowed; integers parse
/// strictly, end to end. A chunk that fails its typed parse leaves the
/// parameter unbound; unbound non-optional parameters fail the whole
/// binding.
///
/// # Errors
/// Returns [`InvalidParams`] when a required parameter did not bind.
pub fn parse_params<'a>(
    raw: &'a str,
    specs: &[ParamSpec],
) -> Result<Vec<BoundParam<'a>>, InvalidParams> {
    let mut bound: Vec<Option<BoundParam<'a>>> = vec![None; specs.len()];
    for chunk in raw.split('&') {
        let Some((key, val)) = chunk.split_once('=') else {
            continue;
        };
        if val.is_empty() {
            continue;
        }
        for (slot, spec) in bound.iter_mut().zip(specs) {
            if slot.is_some() || spec.key != key {
                continue;
            }
            let value = match spec.ty {
                ParamType::Str => Some(ParamValue::Str(val)),
                ParamType::Integer => val.parse().ok().map(ParamValue::Integer),
            };
            if let Some(value) = value {
                *slot = Some(BoundParam {
                    key: spec.key,
                    value,
                });
            }
        }
    }
    let mut out = Vec::with_capacity(specs.len());
    for (slot, spec) in bound.into_iter().zip(specs) {
        match slot {
            Some(param) => out.push(param),
            None if spec.optional => {}
            None => return Err(InvalidParams),
        }
    }
    Ok(out)
}

/// HTML-escapes and filters user text in one pass. `<`, `>`, `&`, `"` and
/// `'` become entities; a newline becomes `<br>` while the run of
/// consecutive newlines stays under `max_newlines` and is dropped beyond
/// that; NUL fails; other control bytes are dropped; printable ASCII and
/// high-bit bytes pass through. The output must leave room for a
/// terminator within `max_out` and must form valid UTF-8.
pub fn sanitize(input: &[u8], max_out: usize, max_newlines: u32) -> Option<String> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len().min(max_out));
    let mut prev_newlines = 0;
    for (i, &byte) in input.iter().enumerate() {
        match byte {
            0 => return None,
            b'<' => push_entity(&mut out, b"&lt;", max_out)?,
            b'>' => push_entity(&mut out, b"&gt;", max_out)?,
            b'&' => push_entity(&mut out, b"&amp;", max_out)?,
            b'"' => push_entity(&mut out, b"&quot;", max_out)?,
            b'\'' => push_entity(&mut out, b"&apos;", max_out)?,
            b'\n' => {
                if prev_newlines < max_newlines {
                    prev_newlines += 1;
                    push_entity(&mut out, b"<br>", max_out)?;
                }
            }
            b' '..=b'~' | 0x80..=0xff => out.push(byte),
            _ => {}
        }
        if byte != b'\n' && byte != b'\r' {
            prev_newlines = 0;
        }
        if i + 1 < input.len() && out.len() + 1 == max_out {
            return None;
        }
    }
    String::from_utf8(out).ok()
}

fn push_entity(out: &mut Vec<u8>, entity: &[u8], max_out: usize) -> Option<()> {
    if out.len() + entity.len() + 1 >= max_out {
        return None;
    }
    out.extend_from_slice(entity);
    Some(())
}

/// A fixed-length magic-number pattern. Positions where `mask` is non-zero
/// are don't-cares; a missing mask means every byte must match.
struct FileSig {
    sig: &'static [u8],
    mask: &'static [u8],
}
impl FileSig {
    fn matches(&self, buf: &[u8]) -> bool {
        buf.len() >= self.sig.len()
            && self.sig.iter().enumerate().all(|(i, &expected)| {
                buf[i] == expected || self.mask.get(i).copied().unwrap_or(0) != 0
            })
    }
}

const PNG_SIGNATURE: FileSig = FileSig {
    sig: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
    mask: &[],
};

const JPEG_SIGNATURES: &[FileSig] = &[
    FileSig {
        sig: &[0xFF, 0xD8, 0xFF, 0xDB],
        mask: &[],
    },
    FileSig {
        sig: &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01],
        mask: &[],
    },
    FileSig {
        sig: &[0xFF, 0xD8, 0xFF, 0xEE],
        mask: &[],
    },
    FileSig {
        sig: &[0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x00, 0x45, 0x78, 0x69, 0x66, 0x00, 0x00],
        mask: &[0, 0, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0],
    },
    FileSig {
        sig: &[0xFF, 0xD8, 0xFF, 0xE0],
        mask: &[],
    },
];

/// Checks an upload's size and magic-number signature against the content
/// type the client declared, returning the verified kind.
#[must_use]
pub fn validate_uploaded_file(buf: &[u8], kind: UploadKind) -> Option<UploadKind> {
    if buf.len() < UPLOAD_MIN_SIZE || buf.len() > UPLOAD_MAX_SIZE {
        warn!("validate_uploaded_file: bad file size {}", buf.len());
        return None;
    }
    if kind == UploadKind::PNG {
        if !PNG_SIGNATURE.matches(buf) {
            warn!("validate_uploaded_file: invalid png signature");
            return None;
        }
        Some(UploadKind::PNG)
    } else if kind == UploadKind::JPEG {
        if !JPEG_SIGNATURES.iter().any(|sig| sig.matches(buf)) {
            warn!("validate_uploaded_file: invalid jpg signature");
            return None;
        }
        Some(UploadKind::JPEG)
    } else {
        warn!("validate_uploaded_file: invalid content type {kind:?}");
        None
    }
}

/// Arguments handed to a route handler: bound parameters and form fields
/// per the route's schemas, the path remainder for wildcard routes, and
/// whether only headers should be emitted (HEAD).
pub struct RouteArgs<'a> {
    pub params: &'a [BoundParam<'a>],
    pub fields: &'a [BoundField<'a>],
    pub path_rem: &'a str,
    pub head_only: bool,
}

type HandlerFn = fn(&mut App, &RouteArgs) -> Response;

struct Route {
    method: Method,
    path: &'static str,
    path_wildcard: bool,
    params: &'static [ParamSpec],
    form: &'static [FieldSpec],
    max_body_size: usize,
    handler: HandlerFn,
}

const REPORT_PARAMS: &[ParamSpec] = &[ParamSpec {
    key: "post_id",
    ty: ParamType::Integer,
    optional: false,
}];

const POST_FORM_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: "thread_id",
        accepted: UploadKind::empty(),
        optional: true,
    },
    FieldSpec {
        key: "name",
        accepted: UploadKind::empty(),
        optional: true,
    },
    FieldSpec {
        key: "subject",
        accepted: UploadKind::empty(),
        optional: true,
    },
    FieldSpec {
        key: "comment",
        accepted: UploadKind::empty(),
        optional: false,
    },
    FieldSpec {
        key: "file",
        accepted: UploadKind::PNG.union(UploadKind::JPEG),
        optional: true,
    },
];

static ROUTES: &[Route] = &[
    Route {
        method: Method::Get,
        path: "/catalog",
        path_wildcard: false,
        params: &[],
        form: &[],
        max_body_size: 0,
        handler: route_catalog,
    },
    Route {
        method: Method::Get,
        path: "/thread/",
        path_wildcard: true,
        params: &[],
        form: &[],
        max_body_size: 0,
        handler: route_thread,
    },
    Route {
        method: Method::Get,
        path: "/report",
        path_wildcard: false,
        params: REPORT_PARAMS,
        form: &[],
        max_body_size: 0,
        handler: route_report,
    },
    Route {
        method: Method::Post,
        path: "/post",
        path_wildcard: false,
        params: &[],
        form: POST_FORM_FIELDS,
        max_body_size: MAX_BODY_SIZE,
        handler: route_post,
    },
    Route {
        method: Method::Get,
        path: "/uploads/",
        path_wildcard: true,
        params: &[],
        form: &[],
        max_body_size: 0,
        handler: route_uploads,
    },
    Route {
        method: Method::Get,
        path: "/",
        path_wildcard: false,
        params: &[],
        form: &[],
        max_body_size: 0,
        handler: route_catalog,
    },
];

fn path_matches<'a>(route: &Route, path: &'a str) -> Option<&'a str> {
    if route.path_wildcard {
        path.strip_prefix(route.path)
    } else if path == route.path {
        Some("")
    } else {
        None
    }
}

/// Pre-body validation, run right after header parsing so oversized or
/// unroutable uploads are refused before a single body byte is read.
#[must_use]
pub fn validate_post_request(req: &Request) -> bool {
    if req.method != Method::Post {
        return false;
    }
    for route in ROUTES {
        if route.method != req.method || path_matches(route, &req.path).is_none() {
            continue;
        }
        if req.content_length.unwrap_or(0) > route.max_body_size {
            warn!("validate_post_request: request body too big");
            return false;
        }
        return true;
    }
    false
}

/// Matches the request against the route table and runs the handler. A
/// HEAD request matches a GET route with `head_only` set. `body` is the
/// complete request body for a POST and empty otherwise.
pub fn do_routing(app: &mut App, req: &Request, body: &[u8]) -> Response {
    for route in ROUTES {
        let mut head_only = false;
        if route.method != req.method {
            if req.method == Method::Head && route.method == Method::Get {
                head_only = true;
            } else {
                continue;
            }
        }
        let Some(path_rem) = path_matches(route, &req.path) else {
            continue;
        };
        return match req.method {
            Method::Get | Method::Head => {
                if route.params.is_empty() {
                    (route.handler)(
                        app,
                        &RouteArgs {
                            params: &[],
                            fields: &[],
                            path_rem,
                            head_only,
                        },
                    )
                } else {
                    let parsed = req
                        .params
                        .as_deref()
                        .ok_or(InvalidParams)
                        .and_then(|raw| parse_params(raw, route.params));
                    match parsed {
                        Ok(params) => (route.handler)(
                            app,
                            &RouteArgs {
                                params: &params,
                                fields: &[],
                                path_rem,
                                head_only,
                            },
                        ),
                        Err(InvalidParams) => {
                            warn!("do_routing: invalid params");
                            Response::error_400(&mut app.cache)
                        }
                    }
                }
            }
            Method::Post => {
                if route.form.is_empty() || req.boundary.is_none() {
                    return Response::error_500(&mut app.cache);
                }
                if req.content_length != Some(body.len()) {
                    return Response::error_500(&mut app.cache);
                }
                let boundary = req.boundary.as_deref().unwrap_or_default();
                match parse_form_data(body, boundary, route.form) {
                    Ok(fields) => (route.handler)(
                        app,
                        &RouteArgs {
                            params: &[],
                            fields: &fields,
                            path_rem,
                            head_only: false,
                        },
                    ),
                    Err(e) => {
                        warn!("do_routing: invalid form fields: {e:?}");
                        Response::error_400(&mut app.cache)
                    }
                }
            }
        };
    }
    Response::error_404(&mut app.cache)
}

fn route_catalog(app: &mut App, args: &RouteArgs) -> Response {
    let App { forum, cache } = app;
    match render_catalog(cache, forum.threads()) {
        Ok(page) => Response::html(page, args.head_only),
        Err(e) => {
            warn!("route_catalog: render failed: {e:?}");
            Response::error_500(cache)
        }
    }
}

fn route_thread(app: &mut App, args: &RouteArgs) -> Response {
    if args.path_rem.is_empty() || !args.path_rem.bytes().all(|b| b.is_ascii_digit()) {
        return Response::error_404(&mut app.cache);
    }
    let Ok(thread_id) = args.path_rem.parse::<u64>() else {
        return Response::error_404(&mut app.cache);
    };
    let App { forum, cache } = app;
    let Some(posts) = forum.posts_by_thread(thread_id) else {
        warn!("route_thread: thread {thread_id} not found");
        return Response::error_404(cache);
    };
    match render_thread(cache, thread_id, posts) {
        Ok(page) => Response::html(page, args.head_only),
        Err(e) => {
            warn!("route_thread: render failed: {e:?}");
            Response::error_500(cache)
        }
    }
}

/// Reporting a thread or post deletes it.
fn route_report(app: &mut App, args: &RouteArgs) -> Response {
    let post_id = args.params.iter().find_map(|p| match p.value {
        ParamValue::Integer(n) if p.key == "post_id" => Some(n),
        _ => None,
    });
    let Some(post_id) = post_id else {
        return Response::error_500(&mut app.cache);
    };
    match u64::try_from(post_id) {
        Ok(id) => app.forum.delete_post_or_thread(id),
        Err(_) => warn!("route_report: post {post_id} not found"),
    }
    Response::redirect_303("/".to_string())
}

fn route_post(app: &mut App, args: &RouteArgs) -> Response {
    match create_from_form(app, args.fields) {
        Ok(location) => Response::redirect_303(location),
        Err(()) => Response::error_400(&mut app.cache),
    }
}

fn create_from_form(app: &mut App, fields: &[BoundField]) -> Result<String, ()> {
    let mut draft = PostDraft::default();
    let mut thread_id = None;
    let mut subject = String::new();
    let mut file: Option<&[u8]> = None;

    for field in fields {
        let Some(value) = field.value else {
            continue;
        };
        match field.key {
            "thread_id" => {
                if value.len() + 1 > 20 {
                    warn!("route_post: thread_id string too large");
                    return Err(());
                }
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok());
                let Some(id) = parsed else {
                    warn!("route_post: failed to parse thread_id");
                    return Err(());
                };
                thread_id = Some(id);
            }
            "subject" => {
                if value.len() + 1 > THREAD_SUBJECT_MAX {
                    warn!("route_post: thread subject too large");
                    return Err(());
                }
                subject = sanitize(value, THREAD_SUBJECT_MAX, 0).ok_or_else(|| {
                    warn!("route_post: failed to sanitize thread subject");
                })?;
            }
            "name" => {
                if value.len() + 1 > POST_NAME_MAX {
                    warn!("route_post: post name too large");
                    return Err(());
                }
                draft.name = sanitize(value, POST_NAME_MAX, 0).ok_or_else(|| {
                    warn!("route_post: failed to sanitize post name");
                })?;
            }
            "comment" => {
                if value.len() + 1 > POST_COMMENT_MAX {
                    warn!("route_post: post comment too large");
                    return Err(());
                }
                draft.comment = sanitize(value, POST_COMMENT_MAX, 2).ok_or_else(|| {
                    warn!("route_post: failed to sanitize post comment");
                })?;
            }
            "file" => {
                let kind = validate_uploaded_file(value, field.kind).ok_or_else(|| {
                    warn!("route_post: failed to validate uploaded file");
                })?;
                let ext = if kind == UploadKind::PNG { ".png" } else { ".jpg" };
                draft.filename = Some(crate::rand::gen_upload_filename(ext));
                file = Some(value);
            }
            _ => {}
        }
    }

    let upload = match (&draft.filename, file) {
        (Some(name), Some(bytes)) => Some((name.clone(), bytes)),
        _ => None,
    };

    let (parent, post_id) = match thread_id {
        None => {
            let id = app.forum.create_thread(draft, &subject).map_err(|e| {
                warn!("route_post: failed to create thread: {e:?}");
            })?;
            (None, id)
        }
        Some(thread_id) => {
            let thread_id = u64::try_from(thread_id).map_err(|_| {
                warn!("route_post: failed to create post: bad thread id");
            })?;
            let id = app.forum.create_post(thread_id, draft).map_err(|e| {
                warn!("route_post: failed to create post: {e:?}");
            })?;
            (Some(thread_id), id)
        }
    };

    if let Some((name, bytes)) = upload {
        if let Err(e) = crate::util::save_file(app.forum.uploads_dir(), &name, bytes) {
            warn!("route_post: failed to save upload {name}: {e}");
        }
    }

    Ok(match parent {
        None => format!("{SERVER_URL}/thread/{post_id}"),
        Some(thread_id) => format!("{SERVER_URL}/thread/{thread_id}#{post_id}"),
    })
}

fn route_uploads(app: &mut App, args: &RouteArgs) -> Response {
    let filename = args.path_rem;
    let name_ok = (5..=30).contains(&filename.len())
        && filename
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.');
    if !name_ok {
        return Response::error_404(&mut app.cache);
    }
    let mime = if filename.ends_with(".png") {
        "image/png"
    } else if filename.ends_with(".jpg") {
        "image/jpeg"
    } else {
        return Response::error_404(&mut app.cache);
    };
    let path = app.forum.uploads_dir().join(filename);
    if args.head_only {
        return match std::fs::metadata(&path) {
            Ok(meta) => Response::file_head(meta.len() as usize, mime),
            Err(_) => Response::error_404(&mut app.cache),
        };
    }
    match std::fs::read(&path) {
        Ok(bytes) => Response::file(bytes, mime),
        Err(e) => {
            warn!("route_uploads: failed to read {}: {e}", path.display());
            Response::error_404(&mut app.cache)
        }
    }
}
