use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::info;

/// Longest single tag the board accepts.
const MAX_TAG_LENGTH: usize = 170;

lazy_static! {
    /// One search term: a run of printable, non-space characters.
    static ref VALID_TERM_PATTERN: Regex = Regex::new(r"^[^\s\p{Cc}]+$").unwrap();

    /// Whitespace separating the terms of a search.
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TagError {
    #[error("Tag must not be empty")]
    Empty,

    #[error("Tag is longer than {} characters", MAX_TAG_LENGTH)]
    TooLong,

    #[error("Tag \"{0}\" contains characters the board does not accept")]
    Invalid(String),
}

pub type TagResult<T> = Result<T, TagError>;

/// Cleans a user supplied search for the listing API.
///
/// The board reads the `tags` parameter as space separated terms, so
/// `"cat rating:s"` searches for two tags and is kept that way. The search is
/// trimmed and lowercased and runs of whitespace collapse to one space.
/// Prefixed terms like `rating:s` and negations like `-comic` pass through.
pub fn normalize_tag(tag: &str) -> TagResult<String> {
    let original_tag = tag.trim().to_lowercase();
    if original_tag.is_empty() {
        return Err(TagError::Empty);
    }

    let cleaned_tag = WHITESPACE_RUN.replace_all(&original_tag, " ").into_owned();
    for term in cleaned_tag.split(' ') {
        if term.chars().count() > MAX_TAG_LENGTH {
            return Err(TagError::TooLong);
        }
        if !VALID_TERM_PATTERN.is_match(term) {
            return Err(TagError::Invalid(cleaned_tag));
        }
    }

    if cleaned_tag != tag {
        info!("Cleaned tag '{}' -> '{}'", tag, cleaned_tag);
    }
    Ok(cleaned_tag)
}
