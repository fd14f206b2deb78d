use bitflags::bitflags;
use log::warn;
use memchr::memmem;

bitflags! {
    /// Upload content types a form field accepts, and the type observed on
    /// a chunk's `Content-Type` line.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct UploadKind: u32 {
        const PNG = 1 << 0;
        const JPEG = 1 << 1;
    }
}

/// One entry of a route's form schema. A field with an empty `accepted`
/// set takes plain text; otherwise the chunk must declare a matching
/// `Content-Type` for its value to bind.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub key: &'static str,
    pub accepted: UploadKind,
    pub optional: bool,
}

/// A schema field after binding against a parsed body. `value` borrows
/// from the body buffer; nothing is copied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundField<'a> {
    pub key: &'static str,
    pub kind: UploadKind,
    pub value: Option<&'a [u8]>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormDataError {
    Truncated,
    MissingTerminator,
    MalformedChunk,
    UnknownField,
    MissingField,
}

const MIN_BODY_LEN: usize = 50;
const CONTENT_DISPOSITION: &[u8] = b"Content-Disposition: form-data;";
const NAME_KEY: &[u8] = b"name=\"";
const CONTENT_TYPE: &[u8] = b"Content-Type: ";

fn find(buf: &[u8], from: usize, to: usize, needle: &[u8]) -> Option<usize> {
    memmem::find(&buf[from..to], needle).map(|i| from + i)
}

/// Parses a multipart/form-data body against a field schema. `boundary`
/// must carry its `--` prefix. Values tolerate arbitrary binary content;
/// everything between a chunk's blank line and the two bytes before the
/// next boundary is the value.
///
/// # Errors
/// Returns an error when the terminating marker is missing, a chunk is
/// malformed, a chunk names a field outside the schema, or a required
/// field did not bind.
pub fn parse_form_data<'a>(
    body: &'a [u8],
    boundary: &[u8],
    specs: &'static [FieldSpec],
) -> Result<Vec<BoundField<'a>>, FormDataError> {
    if body.len() < MIN_BODY_LEN {
        return Err(FormDataError::Truncated);
    }
    if !body.ends_with(b"--\r\n") {
        return Err(FormDataError::MissingTerminator);
    }
    // The closing "--boundary--\r\n" marker ends here; chunk scanning never
    // looks past it.
    let last = body.len() - 4;
    let blen = boundary.len();

    let mut fields: Vec<BoundField<'a>> = specs
        .iter()
        .map(|spec| BoundField {
            key: spec.key,
            kind: UploadKind::empty(),
            value: None,
        })
        .collect();

    let mut t = find(body, 0, last, boundary).ok_or(FormDataError::MalformedChunk)? + blen;
    t = find(body, t, last, b"\r\n").ok_or(FormDataError::MalformedChunk)? + 2;
    // t is at the first chunk's first line

    loop {
        t = find(body, t, last, CONTENT_DISPOSITION).ok_or(FormDataError::MalformedChunk)?
            + CONTENT_DISPOSITION.len();
        while body.get(t) == Some(&b' ') {
            t += 1;
        }
        t = find(body, t, last, NAME_KEY).ok_or(FormDataError::MalformedChunk)? + NAME_KEY.len();
        let line_end = find(body, t, last, b"\r\n").ok_or(FormDataError::MalformedChunk)?;
        let name_len = body[t..line_end]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric())
            .count();
        let name = &body[t..t + name_len];
        let index = specs
            .iter()
            .position(|spec| spec.key.as_bytes() == name)
            .ok_or_else(|| {
                warn!(
                    "parse_form_data: unknown field {:?}",
                    String::from_utf8_lossy(name)
                );
                FormDataError::UnknownField
            })?;
        let accepted = specs[index].accepted;

        t = line_end + 2;
        // t is at the chunk's second line

        let next_boundary = find(body, t, last, boundary).ok_or(FormDataError::MalformedChunk)?;
        let value_end = next_boundary - 2;
        if let Some(ct) = find(body, t, next_boundary, CONTENT_TYPE) {
            if ct != t {
                return Err(FormDataError::MalformedChunk);
            }
            let mime_start = ct + CONTENT_TYPE.len();
            let mime_len = body[mime_start..next_boundary]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'/' || **b == b'-')
                .count();
            let mime = &body[mime_start..mime_start + mime_len];
            if mime == b"image/png" && accepted.contains(UploadKind::PNG) {
                fields[index].kind = UploadKind::PNG;
            } else if mime == b"image/jpeg" && accepted.contains(UploadKind::JPEG) {
                fields[index].kind = UploadKind::JPEG;
            }
            t = find(body, mime_start + mime_len, last, b"\r\n")
                .ok_or(FormDataError::MalformedChunk)?
                + 2;
        }
        t = find(body, t, last, b"\r\n").ok_or(FormDataError::MalformedChunk)? + 2;
        let value_start = t;

        if value_start < value_end
            && (accepted.is_empty() || !fields[index].kind.is_empty())
        {
            fields[index].value = Some(&body[value_start..value_end]);
        }

        if value_end + 2 + blen >= last {
            break;
        }
    }

    for (field, spec) in fields.iter().zip(specs) {
        if field.value.is_none() && !spec.optional {
            warn!("parse_form_data: required field {:?} did not bind", spec.key);
            return Err(FormDataError::MissingField);
        }
    }
    Ok(fields)
}
