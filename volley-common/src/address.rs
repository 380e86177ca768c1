//! Recipient address validation
//!
//! Recipients arrive as bare mailboxes (`local-part@domain`, no angle
//! brackets). They are checked against the RFC 5321 mailbox grammar and a
//! few extra deliverability rules before any relay is contacted:
//!
//! ```text
//! Mailbox        = Local-part "@" Domain
//! Local-part     = Dot-string / Quoted-string
//! Dot-string     = Atom *("." Atom)
//! Quoted-string  = DQUOTE *QcontentSMTP DQUOTE
//! Domain         = sub-domain 1*("." sub-domain)
//! sub-domain     = Let-dig [Ldh-str]
//! ```
//!
//! Dot-string atoms and domain labels additionally accept non-ASCII
//! characters (RFC 6531), and labels accept `_`.
//!
//! # Size Constraints
//!
//! - Maximum address length: 254 octets
//! - Maximum local-part: 64 octets
//! - Maximum domain: 255 octets
//! - The final domain label must be at least two characters

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a complete recipient address
pub const MAX_ADDRESS_LENGTH: usize = 254;

const MAX_LOCAL_PART_LENGTH: usize = 64;
const MAX_DOMAIN_LENGTH: usize = 255;

/// Result type for address parsing
pub type Result<T> = std::result::Result<T, AddressError>;

/// Errors that can occur during address parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Address exceeds {MAX_ADDRESS_LENGTH} octets")]
    TooLong,
    #[error("Local-part exceeds {MAX_LOCAL_PART_LENGTH} octets")]
    LocalPartTooLong,
    #[error("Domain exceeds {MAX_DOMAIN_LENGTH} octets")]
    DomainTooLong,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,
    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

/// A parsed mailbox (local-part@domain)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    /// The local part (before @)
    pub local_part: String,
    /// The domain (after @)
    pub domain: String,
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl std::str::FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        parse_recipient(s)
    }
}

/// Parse and validate a recipient address.
///
/// Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns `AddressError` describing the first rule the address violates.
pub fn parse_recipient(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    if trimmed.len() > MAX_ADDRESS_LENGTH {
        return Err(AddressError::TooLong);
    }

    parse_mailbox(trimmed)
}

/// Returns `true` if `input` is a deliverable-looking recipient address.
#[must_use]
pub fn is_valid_recipient(input: &str) -> bool {
    parse_recipient(input).is_ok()
}

/// Outcome of splitting an uploaded recipient list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientList {
    /// Addresses that passed validation, in input order
    pub valid: Vec<String>,
    /// Non-empty lines that failed validation, in input order
    pub invalid: Vec<String>,
}

/// Split a newline separated recipient list.
///
/// Lines are trimmed and blank lines dropped; the remaining lines are
/// partitioned by [`is_valid_recipient`].
#[must_use]
pub fn parse_recipient_list(text: &str) -> RecipientList {
    let mut list = RecipientList::default();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if is_valid_recipient(line) {
            list.valid.push(line.to_string());
        } else {
            list.invalid.push(line.to_string());
        }
    }

    list
}

/// Parse a Mailbox: `local-part@domain`
fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let at_pos = find_unquoted_at(input)?;

    let local_part = &input[..at_pos];
    let domain = &input[at_pos + 1..];

    if local_part.len() > MAX_LOCAL_PART_LENGTH {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN_LENGTH {
        return Err(AddressError::DomainTooLong);
    }

    let local = parse_local_part(local_part)?;
    let dom = parse_domain(domain)?;

    Ok(Mailbox {
        local_part: local,
        domain: dom,
    })
}

/// Find the byte position of the '@' that is not inside a quoted string
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut prev_was_backslash = false;

    for (i, ch) in input.char_indices() {
        if ch == '"' && !prev_was_backslash {
            in_quotes = !in_quotes;
        } else if ch == '@' && !in_quotes {
            return Ok(i);
        }

        prev_was_backslash = ch == '\\' && !prev_was_backslash;
    }

    Err(AddressError::MissingAtSign)
}

/// Parse a local-part: Dot-string or Quoted-string
fn parse_local_part(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart(
            "Empty local-part".to_string(),
        ));
    }

    if input.starts_with('"') {
        parse_quoted_string(input)
    } else {
        parse_dot_string(input)
    }
}

/// Parse a Dot-string: Atom *("." Atom)
fn parse_dot_string(input: &str) -> Result<String> {
    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot contain consecutive dots".to_string(),
        ));
    }

    for atom in input.split('.') {
        if let Some(ch) = atom.chars().find(|&ch| !is_atext(ch)) {
            return Err(AddressError::InvalidLocalPart(format!(
                "Invalid character '{ch}' in atom"
            )));
        }
    }

    Ok(input.to_string())
}

/// Parse a Quoted-string: DQUOTE *`QcontentSMTP` DQUOTE
fn parse_quoted_string(input: &str) -> Result<String> {
    if !input.ends_with('"') || input.len() < 2 {
        return Err(AddressError::UnclosedQuotedString);
    }

    let content = &input[1..input.len() - 1];

    if content.is_empty() {
        return Err(AddressError::InvalidQuotedString(
            "Empty quoted string".to_string(),
        ));
    }

    let mut chars = content.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next_ch) if next_ch.is_ascii_graphic() || next_ch == ' ' => {}
                Some(next_ch) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "Invalid quoted-pair: \\{next_ch}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "Backslash at end of quoted string".to_string(),
                    ));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "Invalid character '{ch}' in quoted string"
            )));
        }
    }

    Ok(input.to_string())
}

/// Parse a Domain: sub-domain 1*("." sub-domain), with a final label of
/// at least two characters
fn parse_domain(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("Empty domain".to_string()));
    }

    if input.starts_with('[') {
        return Err(AddressError::InvalidDomain(
            "Address literals are not accepted for recipients".to_string(),
        ));
    }

    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidDomain(
            "Domain cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidDomain(
            "Domain cannot contain consecutive dots".to_string(),
        ));
    }

    if !input.contains('.') {
        return Err(AddressError::InvalidDomain(format!(
            "Domain '{input}' has no top-level label"
        )));
    }

    for subdomain in input.split('.') {
        parse_subdomain(subdomain)?;
    }

    if input
        .rsplit('.')
        .next()
        .is_some_and(|tld| tld.chars().count() < 2)
    {
        return Err(AddressError::InvalidDomain(
            "Top-level label must be at least two characters".to_string(),
        ));
    }

    Ok(input.to_string())
}

/// Parse a sub-domain. Besides letters, digits and inner hyphens, labels
/// may carry underscores and non-ASCII letters (internationalised domains
/// in their Unicode form).
fn parse_subdomain(input: &str) -> Result<()> {
    let (Some(first), Some(last)) = (input.chars().next(), input.chars().last()) else {
        return Err(AddressError::InvalidDomain("Empty subdomain".to_string()));
    };

    if first == '-' || last == '-' {
        return Err(AddressError::InvalidDomain(format!(
            "Subdomain '{input}' cannot start or end with '-'"
        )));
    }

    if let Some(ch) = input.chars().find(|&ch| !is_label_char(ch)) {
        return Err(AddressError::InvalidDomain(format!(
            "Invalid character '{ch}' in subdomain"
        )));
    }

    Ok(())
}

#[inline]
fn is_label_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') || is_utf8_non_ascii(ch)
}

/// UTF8-non-ascii as used by RFC 6531, minus whitespace and controls
#[inline]
fn is_utf8_non_ascii(ch: char) -> bool {
    !ch.is_ascii() && !ch.is_whitespace() && !ch.is_control()
}

/// Check if character is valid atext (atom text), extended with
/// UTF8-non-ascii (RFC 6531)
///
/// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" /
///         "*" / "+" / "-" / "/" / "=" / "?" / "^" / "_" / "\`" /
///         "{" / "|" / "}" / "~" / UTF8-non-ascii
#[inline]
fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || is_utf8_non_ascii(ch)
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// qtextSMTP = %d32-33 / %d35-91 / %d93-126 / UTF8-non-ascii
#[inline]
fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch, ' '..='!' | '#'..='[' | ']'..='~') || is_utf8_non_ascii(ch)
}
