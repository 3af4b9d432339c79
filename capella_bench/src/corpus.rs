//! The metric corpus.
//!
//! A corpus is the fixed set of sample metric lines a run draws its payloads
//! from. It is loaded once, before any worker starts, and is immutable
//! afterward, so workers share it through an `Arc` without synchronization.

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::{self, Utf8Error},
};

use rand::Rng;
use tracing::debug;

/// Errors produced by [`Corpus`].
///
/// Every variant means the corpus is unavailable. Either is fatal to the run:
/// without metrics there is nothing to send.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The corpus file could not be read.
    #[error("Corpus unavailable, could not read {path:?}: {source}")]
    Unavailable {
        /// Corpus path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The corpus file was read but is not UTF-8 text.
    #[error("Corpus unavailable, {path:?} is not valid UTF-8: {source}")]
    NotUtf8 {
        /// Corpus path
        path: PathBuf,
        /// Position of the first invalid byte
        #[source]
        source: Utf8Error,
    },
    /// The corpus held no metric lines once blank lines were skipped.
    #[error("Corpus unavailable, {path:?} contains no metric lines")]
    Empty {
        /// Corpus path, or `<memory>` for corpora built from lines
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An indexed, non-empty collection of metric lines.
pub struct Corpus {
    lines: Vec<Box<str>>,
}

impl Corpus {
    /// Load a corpus from a newline-delimited file, skipping blank lines.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the file cannot be read,
    /// [`Error::NotUtf8`] if it is not UTF-8 text and [`Error::Empty`] if it
    /// holds no non-blank line.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path).map_err(|source| Error::Unavailable {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        let contents = str::from_utf8(&bytes).map_err(|source| Error::NotUtf8 {
            path: path.to_path_buf(),
            source,
        })?;
        let lines: Vec<Box<str>> = contents
            .lines()
            .filter(|line| !is_blank(line))
            .map(Box::from)
            .collect();
        let corpus = Self::from_boxed(lines).ok_or_else(|| Error::Empty {
            path: path.to_path_buf(),
        })?;
        debug!(
            "loaded {} metric lines from {}",
            corpus.len(),
            path.display()
        );
        Ok(corpus)
    }

    /// Build a corpus from in-memory lines, skipping blank lines.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] if no non-blank line is supplied.
    pub fn from_lines<I, S>(lines: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<Box<str>> = lines
            .into_iter()
            .filter(|line| !is_blank(AsRef::<str>::as_ref(line)))
            .map(|line| Box::from(AsRef::<str>::as_ref(&line)))
            .collect();
        Self::from_boxed(lines).ok_or_else(|| Error::Empty {
            path: PathBuf::from("<memory>"),
        })
    }

    fn from_boxed(lines: Vec<Box<str>>) -> Option<Self> {
        if lines.is_empty() {
            None
        } else {
            Some(Self { lines })
        }
    }

    /// Select one line uniformly at random from the full index range.
    ///
    /// The caller owns `rng`; this function only reads the corpus, so any
    /// number of workers may call it concurrently.
    #[inline]
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        let idx = rng.random_range(0..self.lines.len());
        &self.lines[idx]
    }

    /// Number of lines in the corpus. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Always false, a corpus is non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Length in bytes of the longest line, excluding the terminator.
    #[must_use]
    pub fn longest_line(&self) -> usize {
        self.lines.iter().map(|l| l.len()).max().unwrap_or(0)
    }

    /// Iterate over the lines in load order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| &**l)
    }
}

// Whitespace-only lines carry no metric and are treated as blank.
fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}
