//! Textual label descriptions.
//!
//! Descriptions come from a line-oriented, tab-separated file: line `i` holds
//! the record of label `i` and fields `2..2 + n` are its raw descriptions.
//! Each label's pool is built once and never modified afterwards.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{EoeError, EoeResult};

/// Text-to-token-ids conversion used for descriptions.
pub trait DescriptionTokenizer {
    /// Encode one description, special tokens included.
    fn encode_ids(&self, text: &str) -> EoeResult<Vec<u32>>;
}

impl DescriptionTokenizer for tokenizers::Tokenizer {
    fn encode_ids(&self, text: &str) -> EoeResult<Vec<u32>> {
        let encoding = self.encode(text, true).map_err(|e| EoeError::InvalidInput {
            message: format!("Failed to tokenize description: {}", e),
        })?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Lowercase, drop everything except ASCII alphanumerics, `.,?!()` and
/// whitespace, then trim.
pub fn preprocess_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || ".,?!()".contains(*c) || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Lines of a description file, read once.
#[derive(Debug, Clone)]
pub struct DescriptionFile {
    lines: Vec<String>,
}

impl DescriptionFile {
    /// Read a description file. Invalid UTF-8 is replaced, not rejected.
    pub fn open(path: impl AsRef<Path>) -> EoeResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        debug!(path = %path.display(), lines = lines.len(), "Read description file");
        Ok(Self { lines })
    }

    /// Build from in-memory lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of label records.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Raw description fields `2..2 + count` of line `index`.
    ///
    /// Records with fewer fields yield fewer descriptions.
    pub fn raw_descriptions(&self, index: usize, count: usize) -> EoeResult<Vec<String>> {
        let line = self.lines.get(index).ok_or_else(|| EoeError::InvalidInput {
            message: format!(
                "description record {} out of range ({} records)",
                index,
                self.lines.len()
            ),
        })?;
        Ok(line
            .split('\t')
            .skip(2)
            .take(count)
            .map(str::to_string)
            .collect())
    }
}

/// Per-label description pools.
#[derive(Debug, Clone, Default)]
pub struct DescriptionStore {
    number_description: usize,
    texts: HashMap<String, Vec<String>>,
    ids: HashMap<String, Vec<Vec<u32>>>,
}

impl DescriptionStore {
    /// Create an empty store keeping up to `number_description` slots per label.
    pub fn new(number_description: usize) -> Self {
        Self {
            number_description,
            texts: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    /// Slots kept per label.
    pub fn number_description(&self) -> usize {
        self.number_description
    }

    /// Whether the label's pool has been built.
    pub fn contains(&self, label: &str) -> bool {
        self.ids.contains_key(label)
    }

    /// Number of labels with a pool.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no pool has been built.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Build the pool of `label` from record `index` of `file`.
    ///
    /// A label whose pool already exists is left untouched.
    pub fn load_label<T>(&mut self, label: &str, index: usize, file: &DescriptionFile, tokenizer: &T) -> EoeResult<()>
    where
        T: DescriptionTokenizer + ?Sized,
    {
        if self.contains(label) {
            debug!(label = label, "Description pool already built");
            return Ok(());
        }

        let texts: Vec<String> = file
            .raw_descriptions(index, self.number_description)?
            .iter()
            .map(|raw| preprocess_text(raw))
            .collect();
        let ids = texts
            .iter()
            .map(|t| tokenizer.encode_ids(t))
            .collect::<EoeResult<Vec<_>>>()?;

        if texts.len() < self.number_description {
            warn!(
                label = label,
                found = texts.len(),
                expected = self.number_description,
                "Description record has fewer fields than requested"
            );
        }

        self.texts.insert(label.to_string(), texts);
        self.ids.insert(label.to_string(), ids);
        Ok(())
    }

    /// Owned copies of the preprocessed texts of `labels`. Missing labels are skipped.
    pub fn get_description<S: AsRef<str>>(&self, labels: &[S]) -> HashMap<String, Vec<String>> {
        collect_pool(&self.texts, labels)
    }

    /// Owned copies of the token ids of `labels`. Missing labels are skipped.
    pub fn get_description_ids<S: AsRef<str>>(&self, labels: &[S]) -> HashMap<String, Vec<Vec<u32>>> {
        collect_pool(&self.ids, labels)
    }
}

fn collect_pool<V: Clone, S: AsRef<str>>(source: &HashMap<String, V>, labels: &[S]) -> HashMap<String, V> {
    let mut pool = HashMap::new();
    for label in labels {
        let label = label.as_ref();
        match source.get(label) {
            Some(v) => {
                pool.insert(label.to_string(), v.clone());
            }
            None => warn!(label = label, "Label description not found"),
        }
    }
    pool
}
