use hashbrown::HashMap;

/// Bidirectional mapping between names and dense indices.
#[derive(Clone, Debug, Default)]
pub struct Alphabet {
    names: Vec<String>,
    indices: HashMap<String, usize>,
}

impl Alphabet {
    /// Creates an empty alphabet.
    #[inline(always)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an alphabet holding `names` in order.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut alphabet = Self::new();
        for name in names {
            alphabet.lookup_or_insert(name.as_ref());
        }
        alphabet
    }

    /// Returns the index of `name`, adding it if it is not present yet.
    pub fn lookup_or_insert(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.indices.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.indices.insert(name.to_string(), idx);
        idx
    }

    /// Returns the index of `name` if it is present.
    #[inline(always)]
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    /// Returns the name at `idx`.
    #[inline(always)]
    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    /// Returns the number of names.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if the alphabet has no names.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates over names in index order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_or_insert() {
        let mut alphabet = Alphabet::new();
        assert_eq!(0, alphabet.lookup_or_insert("A"));
        assert_eq!(1, alphabet.lookup_or_insert("B"));
        assert_eq!(0, alphabet.lookup_or_insert("A"));
        assert_eq!(2, alphabet.len());
        assert_eq!(Some(1), alphabet.lookup("B"));
        assert_eq!(None, alphabet.lookup("C"));
        assert_eq!(Some("B"), alphabet.name(1));
        assert_eq!(vec!["A", "B"], alphabet.iter().collect::<Vec<_>>());
    }
}
