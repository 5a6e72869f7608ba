use std::collections::BTreeMap;

/// Changes that turn `local` into `remote`.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff<K, T> {
    pub insert: Vec<T>,
    pub update: Vec<T>,
    pub delete: Vec<K>,
}

impl<K, T> Diff<K, T> {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Compare two entity sets by key. Rows present on both sides with different
/// content are updates.
pub fn diff_by_key<K, T, F>(local: Vec<T>, remote: Vec<T>, key: F) -> Diff<K, T>
where
    K: Ord + Clone,
    T: PartialEq,
    F: Fn(&T) -> K,
{
    let mut local: BTreeMap<K, T> = local.into_iter().map(|row| (key(&row), row)).collect();
    let mut diff = Diff {
        insert: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
    };

    for row in remote {
        match local.remove(&key(&row)) {
            None => diff.insert.push(row),
            Some(existing) if existing != row => diff.update.push(row),
            Some(_) => {}
        }
    }
    diff.delete = local.into_keys().collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: char,
        value: u32,
    }

    fn rows(pairs: &[(char, u32)]) -> Vec<Row> {
        pairs.iter().map(|(id, value)| Row { id: *id, value: *value }).collect()
    }

    #[test]
    fn reconciles_abc_against_abd() {
        let local = rows(&[('A', 1), ('B', 1), ('C', 1)]);
        let remote = rows(&[('A', 1), ('B', 1), ('D', 1)]);

        let diff = diff_by_key(local, remote, |r| r.id);
        assert_eq!(diff.insert, rows(&[('D', 1)]));
        assert!(diff.update.is_empty());
        assert_eq!(diff.delete, vec!['C']);
    }

    #[test]
    fn changed_content_is_an_update() {
        let diff = diff_by_key(rows(&[('A', 1)]), rows(&[('A', 2)]), |r| r.id);
        assert_eq!(diff.update, rows(&[('A', 2)]));
        assert!(diff.insert.is_empty() && diff.delete.is_empty());
    }

    #[test]
    fn identical_sets_produce_no_changes() {
        let diff = diff_by_key(rows(&[('A', 1), ('B', 2)]), rows(&[('B', 2), ('A', 1)]), |r| r.id);
        assert!(diff.is_empty());
    }
}
