//! File-backed technology catalog.
//!
//! Maps technology names to local repository checkouts, with near-miss
//! suggestions on unknown names so a typo like `reakt` comes back as
//! "did you mean react".

use sage_application::ports::{CatalogError, TechnologyCatalog, TechnologyEntry};

/// Edit distance beyond which a name is no longer a plausible typo.
const MAX_SUGGESTION_DISTANCE: usize = 2;
const MAX_SUGGESTIONS: usize = 3;

/// Catalog backed by configured entries, validated against the filesystem.
pub struct FileTechnologyCatalog {
    entries: Vec<TechnologyEntry>,
}

impl FileTechnologyCatalog {
    /// Builds a catalog from entries. Names are deduplicated
    /// case-insensitively, first registration wins, listing order is
    /// alphabetical.
    pub fn new(entries: impl IntoIterator<Item = TechnologyEntry>) -> Self {
        let mut seen: Vec<TechnologyEntry> = Vec::new();
        for entry in entries {
            if !seen.iter().any(|e| e.name.eq_ignore_ascii_case(&entry.name)) {
                seen.push(entry);
            }
        }
        seen.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries: seen }
    }

    /// Registered names close enough to `name` to be a likely typo:
    /// edit distance at most [`MAX_SUGGESTION_DISTANCE`], or a prefix
    /// match. Closest first, capped at [`MAX_SUGGESTIONS`].
    fn suggestions_for(&self, name: &str) -> Vec<String> {
        let query = name.to_lowercase();
        let query_chars: Vec<char> = query.chars().collect();

        let mut scored: Vec<(usize, &str)> = Vec::new();
        for entry in &self.entries {
            let candidate = entry.name.to_lowercase();

            if !query.is_empty() && candidate.starts_with(&query) {
                scored.push((0, entry.name.as_str()));
                continue;
            }

            // Length difference is a lower bound on the distance; skip the
            // DP when it already exceeds the cutoff.
            let candidate_chars: Vec<char> = candidate.chars().collect();
            if candidate_chars.len().abs_diff(query_chars.len()) > MAX_SUGGESTION_DISTANCE {
                continue;
            }

            let distance = levenshtein(&query_chars, &candidate_chars);
            if distance <= MAX_SUGGESTION_DISTANCE {
                scored.push((distance, entry.name.as_str()));
            }
        }

        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

impl TechnologyCatalog for FileTechnologyCatalog {
    fn resolve(&self, name: &str) -> Result<TechnologyEntry, CatalogError> {
        let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
        else {
            return Err(CatalogError::NotFound {
                name: name.to_string(),
                suggestions: self.suggestions_for(name),
            });
        };

        if !entry.repo_path.exists() {
            return Err(CatalogError::RepoMissing {
                name: entry.name.clone(),
                path: entry.repo_path.clone(),
            });
        }

        Ok(entry.clone())
    }

    fn list(&self) -> Vec<TechnologyEntry> {
        self.entries.clone()
    }
}

/// Levenshtein distance over chars, keeping two DP rows.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
