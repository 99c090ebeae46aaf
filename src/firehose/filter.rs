// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

/// Collection allow-list. Entries may be exact NSIDs or namespace
/// prefixes written as `app.vylet.*`.
#[derive(Debug, Clone, Default)]
pub struct CollectionFilter {
    prefixes: Vec<String>,
}

impl CollectionFilter {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                let entry = entry.strip_suffix(".*").unwrap_or(entry);
                entry.strip_suffix('.').unwrap_or(entry).to_string()
            })
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { prefixes }
    }

    pub fn allows(&self, collection: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| collection == prefix || collection.starts_with(prefix.as_str()))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_and_exact_entries() {
        let filter = CollectionFilter::new(["app.vylet.*", "com.example.graph.follow"]);

        assert_eq!(filter.prefixes(), &["app.vylet", "com.example.graph.follow"]);
        assert!(filter.allows("app.vylet.feed.post"));
        assert!(filter.allows("com.example.graph.follow"));
        assert!(!filter.allows("app.bsky.feed.post"));
        assert!(!filter.allows("com.example.graph.block"));
    }

    #[test]
    fn trailing_dot_is_normalised() {
        let filter = CollectionFilter::new(["app.vylet.feed."]);
        assert!(filter.allows("app.vylet.feed.like"));
        assert!(!filter.allows("app.vylet.graph.follow"));
    }

    #[test]
    fn empty_list_accepts_nothing() {
        let filter = CollectionFilter::new(Vec::<String>::new());
        assert!(!filter.allows("app.vylet.feed.post"));
    }
}
