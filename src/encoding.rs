//! Character encoding normalization for HTML bodies.
//!
//! The portal labels its pages inconsistently: headers often say Latin-1
//! (or nothing, which pre-HTML5 means Latin-1) while the document's
//! `<meta http-equiv="content-type">` claims UTF-8, or the other way round.
//! [`normalize`] decodes the body with the header's charset, compares the
//! header's claim with the document's own, and repairs the one mismatch it
//! understands:
//!
//! - header Latin-1, document UTF-8: if the raw bytes are valid UTF-8 the
//!   document is right and they are kept as they are; otherwise every byte
//!   becomes one code point.
//!
//! Every other disagreement is logged and left alone. The result is always
//! UTF-8 and labelled `text/html;charset=utf-8`, so feeding it through
//! [`normalize`] again changes nothing.

use encoding_rs::Encoding;

/// Content type of every normalized HTML body.
pub const UTF8_HTML: &str = "text/html;charset=utf-8";

/// Content type assumed for unlabelled or explicitly Latin-1 HTML.
pub const LATIN1_HTML: &str = "text/html;charset=iso-8859-1";

/// Lowercase a content type and drop all spaces, so `Text/HTML; Charset=UTF-8`
/// compares equal to `text/html;charset=utf-8`.
pub fn canonical_content_type(raw: &str) -> String {
    raw.to_ascii_lowercase().replace(' ', "")
}

pub fn is_html(content_type: &str) -> bool {
    canonical_content_type(content_type).starts_with("text/html")
}

/// Decode an HTML body into UTF-8.
///
/// Returns the UTF-8 bytes and [`UTF8_HTML`], or a description of why the
/// header's charset could not be used.
pub fn normalize(header_content_type: &str, raw: &[u8]) -> Result<(Vec<u8>, String), String> {
    let mut declared = canonical_content_type(header_content_type);

    let mut text = if declared == "text/html" || declared == LATIN1_HTML {
        declared = LATIN1_HTML.to_string();
        latin1_to_string(raw)
    } else {
        let label = charset_param(&declared).unwrap_or("utf-8");
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| format!("unsupported charset '{}'", label))?;
        let (decoded, _, had_errors) = encoding.decode(raw);
        if had_errors {
            tracing::debug!(charset = label, "Body contains bytes invalid in declared charset");
        }
        decoded.into_owned()
    };

    let document = match meta_content_type(&text) {
        Some(ct) => ct,
        None => {
            tracing::warn!(
                content_type = %declared,
                "No content type declared in document, using header"
            );
            declared.clone()
        }
    };

    if document != declared {
        if document.ends_with("utf-8") && declared == LATIN1_HTML {
            text = match std::str::from_utf8(raw) {
                Ok(valid) => valid.to_string(),
                Err(_) => latin1_to_string(raw),
            };
            tracing::debug!("Repaired UTF-8 document served as Latin-1");
        } else {
            tracing::warn!(
                header = %declared,
                document = %document,
                "Header and document disagree on content type, leaving body as decoded"
            );
        }
    }

    Ok((text.into_bytes(), UTF8_HTML.to_string()))
}

/// ISO-8859-1: every byte is the code point of the same value.
fn latin1_to_string(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("charset="))
        .map(|v| v.trim_matches(|c| c == '"' || c == '\''))
        .find(|v| !v.is_empty())
}

// ============ <meta> scanning ============

/// Content type the document declares for itself, canonicalized.
///
/// Honors `<meta http-equiv="content-type" content="...">` and the HTML5
/// `<meta charset="...">` shorthand; the first declaration wins.
pub fn meta_content_type(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut pos = 0;

    while let Some(offset) = lower[pos..].find("<meta") {
        let start = pos + offset + "<meta".len();
        let end = lower[start..]
            .find('>')
            .map(|e| start + e)
            .unwrap_or(lower.len());
        let attrs = parse_attributes(&html[start..end]);
        pos = end;

        let attr = |name: &str| {
            attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        if attr("http-equiv").is_some_and(|v| v.eq_ignore_ascii_case("content-type")) {
            if let Some(content) = attr("content") {
                return Some(canonical_content_type(content));
            }
        }
        if let Some(charset) = attr("charset") {
            return Some(format!("text/html;charset={}", canonical_content_type(charset)));
        }
    }
    None
}

/// Attributes of one tag body as `(lowercased name, raw value)` pairs.
fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = tag.char_indices().peekable();

    loop {
        while chars
            .peek()
            .is_some_and(|&(_, c)| c.is_whitespace() || c == '/')
        {
            chars.next();
        }
        let Some(&(name_start, _)) = chars.peek() else {
            break;
        };

        let mut name_end = tag.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == '=' || c == '/' {
                name_end = i;
                break;
            }
            chars.next();
        }
        let name = tag[name_start..name_end].to_ascii_lowercase();

        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().map(|&(_, c)| c) != Some('=') {
            if !name.is_empty() {
                attrs.push((name, String::new()));
            }
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }

        let value = match chars.peek().map(|&(_, c)| c) {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut value = String::new();
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        break;
                    }
                    value.push(c);
                }
                value
            }
            _ => {
                let mut value = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value
            }
        };
        attrs.push((name, value));
    }
    attrs
}
