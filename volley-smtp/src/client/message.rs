//! MIME message composition for outgoing submissions.

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{Rng, distr::Alphanumeric};

use super::error::{ClientError, Result};

/// Maximum encoded line length for base64 bodies (RFC 2045 §6.8)
const BASE64_LINE_LENGTH: usize = 76;

/// Header lines are folded to this width where whitespace allows
/// (RFC 5322 §2.1.1)
const HEADER_LINE_LENGTH: usize = 78;

/// Hard limit on any line, excluding CRLF
const MAX_LINE_LENGTH: usize = 998;

/// Longest permitted encoded-word (RFC 2047 §2)
const ENCODED_WORD_LENGTH: usize = 75;

const ENCODED_WORD_PREFIX: &str = "=?UTF-8?B?";
const ENCODED_WORD_SUFFIX: &str = "?=";

/// Builder for a `multipart/alternative` message with a plain-text and an
/// HTML part.
///
/// `Date`, `Message-ID` and `MIME-Version` are filled in by [`build`] unless
/// supplied through [`header`].
///
/// [`build`]: MessageBuilder::build
/// [`header`]: MessageBuilder::header
#[derive(Debug, Default, Clone)]
pub struct MessageBuilder {
    from: Option<(Option<String>, String)>,
    to: Vec<String>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    html: Option<String>,
    text: Option<String>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the author address, optionally with a display name.
    #[must_use]
    pub fn from(mut self, display_name: Option<&str>, address: impl Into<String>) -> Self {
        self.from = Some((
            display_name.filter(|n| !n.is_empty()).map(ToString::to_string),
            address.into(),
        ));
        self
    }

    /// Adds a `To` address.
    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds an extra header. Headers are written in insertion order after
    /// the standard ones.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    /// Sets the plain-text alternative. Without one, the HTML with its tags
    /// stripped is used.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    /// Renders the message with CRLF line endings, ready for DATA.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::BuilderError` if the author, every recipient or
    /// both bodies are missing, or a header value contains a line break.
    pub fn build(self) -> Result<String> {
        let (display_name, from) = self
            .from
            .ok_or_else(|| ClientError::BuilderError("missing From address".to_string()))?;
        if self.to.is_empty() {
            return Err(ClientError::BuilderError(
                "at least one recipient is required".to_string(),
            ));
        }
        if self.html.is_none() && self.text.is_none() {
            return Err(ClientError::BuilderError(
                "message has no body".to_string(),
            ));
        }

        for (name, value) in &self.headers {
            if name.contains([':', '\r', '\n']) || value.contains(['\r', '\n']) {
                return Err(ClientError::BuilderError(format!(
                    "header '{name}' contains illegal characters"
                )));
            }
        }

        let has_header = |wanted: &str| {
            self.headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(wanted))
        };

        let mut out = String::new();
        let mut push_header = |name: &str, value: &str| fold_header(&mut out, name, value);

        push_header("From", &format_mailbox(display_name.as_deref(), &from));
        push_header("To", &self.to.join(", "));
        push_header(
            "Subject",
            &header_text("Subject", self.subject.as_deref().unwrap_or_default()),
        );
        if !has_header("Date") {
            push_header("Date", &chrono::Utc::now().to_rfc2822());
        }
        if !has_header("Message-ID") {
            push_header("Message-ID", &message_id(&from));
        }
        push_header("MIME-Version", "1.0");
        for (name, value) in &self.headers {
            push_header(name, value);
        }

        let text = self
            .text
            .or_else(|| self.html.as_deref().map(strip_tags))
            .unwrap_or_default();

        match self.html {
            Some(html) => {
                let boundary = format!("=_volley_{}", random_token(24));
                push_header(
                    "Content-Type",
                    &format!("multipart/alternative; boundary=\"{boundary}\""),
                );
                out.push_str("\r\n");

                push_part(&mut out, &boundary, "text/plain", &text);
                push_part(&mut out, &boundary, "text/html", &html);

                out.push_str("--");
                out.push_str(&boundary);
                out.push_str("--\r\n");
            }
            None => {
                push_header("Content-Type", "text/plain; charset=utf-8");
                push_header("Content-Transfer-Encoding", "base64");
                out.push_str("\r\n");
                push_base64(&mut out, &text);
            }
        }

        Ok(out)
    }
}

fn push_part(out: &mut String, boundary: &str, content_type: &str, body: &str) {
    out.push_str("--");
    out.push_str(boundary);
    out.push_str("\r\nContent-Type: ");
    out.push_str(content_type);
    out.push_str("; charset=utf-8\r\nContent-Transfer-Encoding: base64\r\n\r\n");
    push_base64(out, body);
}

fn push_base64(out: &mut String, body: &str) {
    let encoded = STANDARD.encode(body);
    // base64 output is ASCII, so byte chunks are valid str boundaries
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_LENGTH) {
        out.extend(chunk.iter().copied().map(char::from));
        out.push_str("\r\n");
    }
}

/// Writes `name: value` folded before whitespace, so that lines stay
/// within [`HEADER_LINE_LENGTH`] unless a single word is longer.
fn fold_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push(':');

    let mut line = name.len() + 1;
    for (i, piece) in fold_points(value).into_iter().enumerate() {
        if i == 0 {
            out.push(' ');
            line += 1;
        } else if line + piece.len() > HEADER_LINE_LENGTH {
            // The piece starts with whitespace, which marks the
            // continuation line
            out.push_str("\r\n");
            line = 0;
        }
        out.push_str(piece);
        line += piece.len();
    }

    out.push_str("\r\n");
}

/// Splits `value` in front of every run of spaces or tabs. Joining the
/// pieces gives back `value`.
fn fold_points(value: &str) -> Vec<&str> {
    let mut starts = vec![0];
    let mut previous_blank = true;
    for (i, c) in value.char_indices() {
        let blank = matches!(c, ' ' | '\t');
        if blank && !previous_blank {
            starts.push(i);
        }
        previous_blank = blank;
    }
    starts.push(value.len());

    starts.windows(2).map(|w| &value[w[0]..w[1]]).collect()
}

/// Header text as is when it is printable ASCII and every word fits on a
/// line, otherwise as a run of encoded-words.
fn header_text(name: &str, value: &str) -> String {
    let printable = value.chars().all(|c| c.is_ascii() && !c.is_ascii_control());
    let fits = value
        .split([' ', '\t'])
        .all(|word| name.len() + 2 + word.len() <= MAX_LINE_LENGTH);

    if printable && fits {
        value.to_string()
    } else {
        encode_words(value)
    }
}

/// RFC 2047 `B` encoding, split into space separated encoded-words of at
/// most [`ENCODED_WORD_LENGTH`] characters. Chunks end on character
/// boundaries; decoders drop the space between adjacent encoded-words.
fn encode_words(value: &str) -> String {
    let room = ENCODED_WORD_LENGTH - ENCODED_WORD_PREFIX.len() - ENCODED_WORD_SUFFIX.len();
    let max_bytes = room / 4 * 3;

    let mut chunks = Vec::new();
    let mut start = 0;
    for (i, c) in value.char_indices() {
        if i + c.len_utf8() - start > max_bytes {
            chunks.push(&value[start..i]);
            start = i;
        }
    }
    chunks.push(&value[start..]);

    chunks
        .into_iter()
        .map(|chunk| format!("{ENCODED_WORD_PREFIX}{}{ENCODED_WORD_SUFFIX}", STANDARD.encode(chunk)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats `"Display Name" <address>`, encoding the name if it is not
/// printable ASCII.
fn format_mailbox(display_name: Option<&str>, address: &str) -> String {
    match display_name {
        Some(name) if header_text("From", name) == name => {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\" <{address}>")
        }
        Some(name) => format!("{} <{address}>", encode_words(name)),
        None => format!("<{address}>"),
    }
}

fn message_id(from: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map_or("localhost", |(_, domain)| domain);
    format!(
        "<{}.{}@{domain}>",
        chrono::Utc::now().timestamp_millis(),
        random_token(16)
    )
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Removes everything between `<` and `>`.
///
/// This is a plain-text fallback, not a sanitiser.
#[must_use]
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out
}
