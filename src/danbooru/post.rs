//! Post records and their ratings
//!
//! This module provides:
//! 1. The closed `Rating` classification and a `RatingSet` of accepted ratings
//! 2. The `Post` record parsed out of one listing page
//! 3. Tolerant conversion from raw listing JSON, dropping malformed records

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Unique identity of a post on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub u64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content rating of a post. Governs the filter and the destination directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Safe,
    Risky,
    Explicit,
}

impl Rating {
    /// Every rating, in display order.
    pub const ALL: [Rating; 3] = [Rating::Safe, Rating::Risky, Rating::Explicit];

    /// Parses the single-letter rating code used by the listing API.
    ///
    /// `g` (general) is the newer split of the old `s` rating and is treated as safe.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" | "g" => Some(Rating::Safe),
            "q" => Some(Rating::Risky),
            "e" => Some(Rating::Explicit),
            _ => None,
        }
    }

    /// Name of the subdirectory posts with this rating are saved into.
    pub fn directory_name(&self) -> &'static str {
        match self {
            Rating::Safe => "safe",
            Rating::Risky => "risky",
            Rating::Explicit => "explicit",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Rating::Safe => 0b001,
            Rating::Risky => 0b010,
            Rating::Explicit => 0b100,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// A set of accepted ratings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RatingSet(u8);

impl RatingSet {
    pub fn empty() -> Self {
        Self(0)
    }

    #[cfg(test)]
    pub fn all() -> Self {
        Rating::ALL.into_iter().collect()
    }

    /// Builds a set from the three on/off switches the user is asked for.
    pub fn from_flags(safe: bool, risky: bool, explicit: bool) -> Self {
        let mut set = Self::empty();
        if safe {
            set.insert(Rating::Safe);
        }
        if risky {
            set.insert(Rating::Risky);
        }
        if explicit {
            set.insert(Rating::Explicit);
        }
        set
    }

    pub fn insert(&mut self, rating: Rating) {
        self.0 |= rating.bit();
    }

    pub fn contains(&self, rating: Rating) -> bool {
        self.0 & rating.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Rating> + '_ {
        Rating::ALL.into_iter().filter(|r| self.contains(*r))
    }
}

impl FromIterator<Rating> for RatingSet {
    fn from_iter<I: IntoIterator<Item = Rating>>(iter: I) -> Self {
        let mut set = Self::empty();
        for rating in iter {
            set.insert(rating);
        }
        set
    }
}

impl fmt::Display for RatingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|r| r.directory_name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Post data as returned by the listing API.
///
/// `file_url` and `file_ext` are missing for some posts (deleted, banned or
/// restricted files). Such posts are kept here and only dropped when a download
/// is planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: PostId,
    pub rating: Rating,
    pub file_url: Option<String>,
    pub file_ext: Option<String>,
}

impl Post {
    /// Deterministic save location: `<output>/<rating>/<id>.<ext>`.
    ///
    /// Returns `None` when the extension is unknown or anything other than
    /// ASCII letters and digits, so a path can never leave the rating directory.
    pub fn destination(&self, output_dir: &Path) -> Option<PathBuf> {
        let ext = self
            .file_ext
            .as_deref()
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))?;
        Some(
            output_dir
                .join(self.rating.directory_name())
                .join(format!("{}.{}", self.id, ext)),
        )
    }

    /// Converts one raw listing entry, or `None` when required fields are absent.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_u64()?;
        let rating = Rating::from_code(value.get("rating")?.as_str()?)?;
        let file_url = value
            .get("file_url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let file_ext = value
            .get("file_ext")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Some(Self {
            id: PostId(id),
            rating,
            file_url,
            file_ext,
        })
    }
}

/// Converts every entry of a listing page, logging and skipping malformed ones.
pub fn posts_from_values(values: &[Value]) -> Vec<Post> {
    values
        .iter()
        .filter_map(|value| {
            let post = Post::from_value(value);
            if post.is_none() {
                debug!("Skipping malformed post record: {}", value);
            }
            post
        })
        .collect()
}
