//! Per-recipient placeholder expansion.
//!
//! | Placeholder  | Replaced with                                      |
//! |--------------|----------------------------------------------------|
//! | `{n:K}`      | K random decimal digits                            |
//! | `{nw:K}`     | K random characters from `[A-Za-z0-9]`             |
//! | `{template}` | a random entry of the template catalog             |
//! | `{link}`     | a random entry of the link catalog                 |
//!
//! Every occurrence draws independently. Catalog placeholders are expanded
//! first so that template fragments may themselves carry `{n:K}` and
//! `{nw:K}`; text inserted from a catalog is never scanned for further
//! catalog placeholders. A catalog placeholder whose catalog is empty is
//! left as is and reported in [`Rendered::unresolved`].

use rand::{
    Rng,
    distr::{Alphanumeric, Distribution},
    seq::IndexedRandom,
};
use serde::{Deserialize, Serialize};

/// Longest `K` honoured in `{n:K}` / `{nw:K}`; longer ones are left as is.
pub const MAX_RANDOM_LENGTH: usize = 1024;

const TEMPLATE: &str = "{template}";
const LINK: &str = "{link}";

/// Content fragments drawn by the catalog placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
}

/// Catalog placeholder kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CatalogKind {
    Template,
    Link,
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Template => TEMPLATE,
            Self::Link => LINK,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Catalog placeholders left in place because their catalog is empty
    pub unresolved: Vec<CatalogKind>,
}

/// Expands every placeholder in `text` using the thread-local RNG.
#[must_use]
pub fn render(text: &str, catalog: &Catalog) -> Rendered {
    render_with(text, catalog, &mut rand::rng())
}

/// [`render`] with a caller supplied RNG.
pub fn render_with<R: Rng + ?Sized>(text: &str, catalog: &Catalog, rng: &mut R) -> Rendered {
    let mut unresolved = Vec::new();

    let text = expand_catalogs(text, catalog, rng, &mut unresolved);
    let text = expand_random(&text, rng);

    Rendered { text, unresolved }
}

fn expand_catalogs<R: Rng + ?Sized>(
    text: &str,
    catalog: &Catalog,
    rng: &mut R,
    unresolved: &mut Vec<CatalogKind>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];

        let matched = [(TEMPLATE, CatalogKind::Template), (LINK, CatalogKind::Link)]
            .into_iter()
            .find(|(token, _)| candidate.starts_with(token));

        match matched {
            Some((token, kind)) => {
                let entries = match kind {
                    CatalogKind::Template => &catalog.templates,
                    CatalogKind::Link => &catalog.links,
                };

                if let Some(entry) = entries.choose(rng) {
                    out.push_str(entry);
                } else {
                    out.push_str(token);
                    if !unresolved.contains(&kind) {
                        unresolved.push(kind);
                    }
                }
                rest = &candidate[token.len()..];
            }
            None => {
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn expand_random<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];

        if let Some((alphabet, length, consumed)) = random_token(candidate) {
            match alphabet {
                Alphabet::Digits => {
                    out.extend((0..length).map(|_| char::from(b'0' + rng.random_range(0..10u8))));
                }
                Alphabet::Alphanumeric => {
                    out.extend(
                        Alphanumeric
                            .sample_iter(&mut *rng)
                            .take(length)
                            .map(char::from),
                    );
                }
            }
            rest = &candidate[consumed..];
        } else {
            out.push('{');
            rest = &candidate[1..];
        }
    }

    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Digits,
    Alphanumeric,
}

/// Recognises `{n:K}` or `{nw:K}` at the start of `input`, returning the
/// alphabet, `K` and the number of bytes the placeholder spans.
fn random_token(input: &str) -> Option<(Alphabet, usize, usize)> {
    let (alphabet, after_prefix) = if let Some(rest) = input.strip_prefix("{nw:") {
        (Alphabet::Alphanumeric, rest)
    } else if let Some(rest) = input.strip_prefix("{n:") {
        (Alphabet::Digits, rest)
    } else {
        return None;
    };

    let digits = after_prefix
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 || after_prefix.as_bytes().get(digits) != Some(&b'}') {
        return None;
    }

    let length = after_prefix[..digits]
        .parse::<usize>()
        .ok()
        .filter(|&length| length <= MAX_RANDOM_LENGTH)?;

    let consumed = input.len() - after_prefix.len() + digits + 1;
    Some((alphabet, length, consumed))
}
