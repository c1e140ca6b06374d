//! Backend URL construction from route templates
//!
//! A template is an ordered list of literal chunks and ordinal references
//! into the matched path parameters. Literals and parameter values may be
//! written with or without a leading slash; it is stripped before
//! concatenation so adjoining elements never produce `//`. Parameter
//! values are percent-encoded as single path segments, so a captured
//! remainder like `/bar/baz` lands in the URL as `bar%2Fbaz`.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::routes::TemplateElement;

/// Everything that must be escaped inside one URL path segment. This is
/// the complement of RFC 3986 `pchar`: unreserved characters, sub-delims,
/// `:` and `@` stay literal; everything else (slashes included) is
/// percent-encoded.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@');

/// Template substitution failures. Any of these surfaces to the client as
/// a 400.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template references a parameter the pattern never captured.
    #[error("template references parameter {index} but the request bound only {available}")]
    IndexOutOfRange {
        /// Ordinal the template asked for.
        index: u64,
        /// Number of parameters actually captured.
        available: usize,
    },
}

/// Materialise the backend URL for one matched request.
///
/// `bindings` are the captured parameters in pattern order; `query` is
/// the raw query string of the inbound request, appended verbatim behind
/// a `?` when non-empty.
pub fn build_target_url(
    template: &[TemplateElement],
    bindings: &[(String, String)],
    query: Option<&str>,
) -> Result<String, TemplateError> {
    let mut url = String::new();
    for element in template {
        match element {
            TemplateElement::Literal(text) => {
                url.push_str(text.strip_prefix('/').unwrap_or(text));
            }
            TemplateElement::Param(index) => {
                let value = bindings
                    .get(*index as usize)
                    .map(|(_, v)| v.as_str())
                    .ok_or(TemplateError::IndexOutOfRange {
                        index: *index,
                        available: bindings.len(),
                    })?;
                let value = value.strip_prefix('/').unwrap_or(value);
                url.extend(utf8_percent_encode(value, PATH_SEGMENT));
            }
        }
    }

    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }

    Ok(url)
}
