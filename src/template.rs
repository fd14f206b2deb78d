use crate::config::MAX_RESPONSE_SIZE;
use crate::forum::{Post, Thread};
use crate::resource_cache::ResourceCache;
use memchr::memmem;
use std::fmt::Display;
use std::sync::Arc;

const TEMPLATE_PARTS_DIR: &str = "templates/parts/";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TemplateError {
    MalformedDirective(String),
    UnknownCommand(String),
    UnknownCallout(String),
    ResponseTooLarge,
}

/// Walks a template line by line, copying literal lines into the output
/// and executing directives. A directive line reads `{{ CMD ARG }}`:
/// `include` splices a cached part file plus a newline, `fun` yields
/// control back to the caller with its argument.
pub struct TemplateCursor {
    src: Arc<[u8]>,
    pos: usize,
}
impl TemplateCursor {
    #[must_use]
    pub fn new(src: Arc<[u8]>) -> Self {
        Self { src, pos: 0 }
    }

    /// Runs until the next `fun` callout and returns its argument, or
    /// `None` at the end of the template.
    ///
    /// # Errors
    /// Returns an error on a malformed directive, an unknown command, or
    /// output past the response size cap.
    pub fn run(
        &mut self,
        out: &mut Vec<u8>,
        cache: &mut ResourceCache,
    ) -> Result<Option<String>, TemplateError> {
        let src = Arc::clone(&self.src);
        while self.pos < src.len() {
            let rest = &src[self.pos..];
            let line_len = memchr::memchr(b'\n', rest).map_or(rest.len(), |i| i + 1);
            let line = &rest[..line_len];
            self.pos += line_len;
            if !line.starts_with(b"{{") {
                append(out, line)?;
                continue;
            }
            let (cmd, arg) = parse_directive(line)?;
            match cmd.as_str() {
                "include" => include_part(out, cache, &arg)?,
                "fun" => return Ok(Some(arg)),
                _ => return Err(TemplateError::UnknownCommand(cmd)),
            }
        }
        Ok(None)
    }
}

fn parse_directive(line: &[u8]) -> Result<(String, String), TemplateError> {
    let malformed = || TemplateError::MalformedDirective(String::from_utf8_lossy(line).to_string());
    let text = std::str::from_utf8(line).map_err(|_| malformed())?;
    let text = text.trim_end_matches(['\r', '\n']);
    let body = text
        .strip_prefix("{{ ")
        .and_then(|s| s.strip_suffix(" }}"))
        .ok_or_else(malformed)?;
    let (cmd, rest) = body.split_once(' ').ok_or_else(malformed)?;
    let arg = match rest.split_once(' ') {
        Some((arg, _)) => arg,
        None => rest,
    };
    if cmd.is_empty() || arg.is_empty() {
        return Err(malformed());
    }
    Ok((cmd.to_string(), arg.to_string()))
}

fn include_part(
    out: &mut Vec<u8>,
    cache: &mut ResourceCache,
    filename: &str,
) -> Result<(), TemplateError> {
    let part = cache.get(&format!("{TEMPLATE_PARTS_DIR}{filename}"));
    append(out, &part)?;
    append(out, b"\n")
}

fn append(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), TemplateError> {
    if out.len() + bytes.len() > MAX_RESPONSE_SIZE {
        return Err(TemplateError::ResponseTooLarge);
    }
    out.extend_from_slice(bytes);
    Ok(())
}

/// Fills a part's positional `{}` placeholders with `args`, in order.
/// Appended argument text is never rescanned, so values may contain `{}`.
fn fill(out: &mut Vec<u8>, format: &[u8], args: &[&dyn Display]) -> Result<(), TemplateError> {
    let mut rest = format;
    let mut args = args.iter();
    while let Some(i) = memmem::find(rest, b"{}") {
        append(out, &rest[..i])?;
        match args.next() {
            Some(arg) => append(out, arg.to_string().as_bytes())?,
            None => append(out, b"{}")?,
        }
        rest = &rest[i + 2..];
    }
    append(out, rest)
}

fn sized_buffer(item_count: usize) -> Result<Vec<u8>, TemplateError> {
    let capacity = 4 * 1024 + item_count * 1024;
    if capacity > MAX_RESPONSE_SIZE {
        return Err(TemplateError::ResponseTooLarge);
    }
    Ok(Vec::with_capacity(capacity))
}

fn posts_in_thread(
    out: &mut Vec<u8>,
    cache: &mut ResourceCache,
    posts: &[Post],
) -> Result<(), TemplateError> {
    let format_img = cache.get("templates/parts/post_in_thread_img.html");
    let format_noimg = cache.get("templates/parts/post_in_thread_noimg.html");
    for post in posts.iter().filter(|p| !p.hidden) {
        match post.filename.as_deref() {
            Some(filename) if !filename.is_empty() => fill(
                out,
                &format_img,
                &[
                    &post.id as &dyn Display,
                    &post.name,
                    &post.timestamp,
                    &post.id,
                    &post.id,
                    &post.id,
                    &filename,
                    &filename,
                    &post.comment,
                ],
            )?,
            _ => fill(
                out,
                &format_noimg,
                &[
                    &post.id as &dyn Display,
                    &post.name,
                    &post.timestamp,
                    &post.id,
                    &post.id,
                    &post.id,
                    &post.comment,
                ],
            )?,
        }
        append(out, b"\n")?;
    }
    Ok(())
}

fn posts_in_catalog(
    out: &mut Vec<u8>,
    cache: &mut ResourceCache,
    threads: &[Thread],
) -> Result<(), TemplateError> {
    let format = cache.get("templates/parts/post_in_catalog.html");
    for thread in threads {
        let op = &thread.posts[0];
        let filename = op.filename.as_deref().unwrap_or("");
        fill(
            out,
            &format,
            &[
                &thread.subject as &dyn Display,
                &op.name,
                &op.timestamp,
                &op.id,
                &op.id,
                &filename,
                &filename,
                &op.comment,
                &op.id,
            ],
        )?;
        append(out, b"\n")?;
    }
    Ok(())
}

/// Renders a thread page: title, reply form, and every visible post.
///
/// # Errors
/// Returns an error when the template is malformed or the page outgrows
/// the response size cap.
pub fn render_thread(
    cache: &mut ResourceCache,
    thread_id: u64,
    posts: &[Post],
) -> Result<Vec<u8>, TemplateError> {
    let title = format!("Thread no. {thread_id}");
    let mut out = sized_buffer(posts.len())?;
    let mut cursor = TemplateCursor::new(cache.get("templates/thread.html"));
    while let Some(fun) = cursor.run(&mut out, cache)? {
        match fun.as_str() {
            "title" => append(&mut out, format!("<title>{title}</title>\n").as_bytes())?,
            "new_post_form" => {
                let part = cache.get("templates/parts/new_post_form.html");
                fill(&mut out, &part, &[&thread_id as &dyn Display])?;
            }
            "posts_in_thread" => posts_in_thread(&mut out, cache, posts)?,
            other => return Err(TemplateError::UnknownCallout(other.to_string())),
        }
    }
    Ok(out)
}

/// Renders the catalog page: one entry per thread, or the no-threads
/// notice when the forum is empty.
///
/// # Errors
/// Returns an error when the template is malformed or the page outgrows
/// the response size cap.
pub fn render_catalog(
    cache: &mut ResourceCache,
    threads: &[Thread],
) -> Result<Vec<u8>, TemplateError> {
    let mut out = sized_buffer(threads.len())?;
    let mut cursor = TemplateCursor::new(cache.get("templates/catalog.html"));
    while let Some(fun) = cursor.run(&mut out, cache)? {
        match fun.as_str() {
            "posts_in_catalog" => {
                if threads.is_empty() {
                    include_part(&mut out, cache, "no_threads_active.html")?;
                } else {
                    posts_in_catalog(&mut out, cache, threads)?;
                }
            }
            other => return Err(TemplateError::UnknownCallout(other.to_string())),
        }
    }
    Ok(out)
}
