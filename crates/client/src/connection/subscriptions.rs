use std::collections::BTreeSet;

/// Tables acknowledged by the server. Each name appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    tables: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Returns false if the table was already present
    pub fn insert(&mut self, table: impl Into<String>) -> bool {
        self.tables.insert(table.into())
    }

    pub fn extend<I, S>(&mut self, tables: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
    }

    /// Requested names not yet subscribed, deduplicated, in request order
    pub fn missing<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        let mut seen = BTreeSet::new();
        requested
            .iter()
            .map(String::as_str)
            .filter(|t| !self.contains(t) && seen.insert(*t))
            .collect()
    }

    pub fn tables(&self) -> Vec<String> {
        self.tables.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
