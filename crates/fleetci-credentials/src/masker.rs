//! Redaction of secret values from job output.

use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeSet;

/// Replacement for every masked occurrence.
pub const MASK: &str = "***";

/// Literal secrets registered for the current job.
///
/// Matching is exact and case-sensitive. Longer values are tried first so a
/// secret that contains another registered secret is masked whole. Output is
/// masked a line at a time, so each line of a multi-line secret (keys,
/// certificates) is registered as well.
#[derive(Debug, Default)]
pub struct LogMasker {
    values: BTreeSet<String>,
    pattern: Option<Regex>,
}

impl LogMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut masker = Self::new();
        masker.extend(values);
        masker
    }

    pub fn add(&mut self, value: impl Into<String>) {
        self.extend([value.into()]);
    }

    pub fn extend<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.values.len();
        for value in values {
            let value: String = value.into();
            if value.is_empty() {
                continue;
            }
            if value.contains('\n') {
                let lines = value
                    .lines()
                    .map(|line| line.trim_end_matches('\r'))
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string);
                self.values.extend(lines);
            }
            self.values.insert(value);
        }
        if self.values.len() != before {
            self.rebuild();
        }
    }

    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(text, MASK),
            None => Cow::Borrowed(text),
        }
    }

    /// Forget every registered value.
    pub fn clear(&mut self) {
        self.values.clear();
        self.pattern = None;
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    fn rebuild(&mut self) {
        let mut values: Vec<&String> = self.values.iter().collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        let alternation = values
            .iter()
            .map(|v| regex::escape(v))
            .collect::<Vec<_>>()
            .join("|");
        // Only fails when the compiled size limit is exceeded.
        self.pattern = Regex::new(&alternation).ok();
        if self.pattern.is_none() {
            tracing::warn!(
                count = self.values.len(),
                "Mask pattern too large, using literal replacement"
            );
        }
    }

    /// Substring replacement used when no compiled pattern is available.
    pub fn mask_literal(&self, text: &str) -> String {
        let mut values: Vec<&String> = self.values.iter().collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        values
            .into_iter()
            .fold(text.to_string(), |acc, v| acc.replace(v.as_str(), MASK))
    }

    /// Mask using the compiled pattern, or literal replacement if it could not be built.
    pub fn mask_line(&self, text: &str) -> String {
        if self.pattern.is_some() || self.values.is_empty() {
            self.mask(text).into_owned()
        } else {
            self.mask_literal(text)
        }
    }
}
