//! Name → extension mapping owned by the session.
//!
//! Two views matter: insertion order for lifecycle iteration (the init
//! extension always first), and a lexicographically sorted name list for
//! transport advertisement so both peers compute the same extension
//! numbering regardless of registration order.

use std::collections::HashMap;

use crate::extension::Extension;
use crate::ProtocolError;

pub(crate) struct ExtensionRegistry {
    /// Insertion order; index 0 is the init extension.
    ordered: Vec<Extension>,
    by_name: HashMap<String, usize>,
}

impl ExtensionRegistry {
    /// Create a registry seeded with the init extension.
    pub(crate) fn new(init: Extension) -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(init.name().to_owned(), 0);
        Self {
            ordered: vec![init],
            by_name,
        }
    }

    pub(crate) fn insert(&mut self, extension: Extension) -> Result<(), ProtocolError> {
        let name = extension.name().to_owned();
        if self.by_name.contains_key(&name) {
            return Err(ProtocolError::invalid_argument(format!(
                "extension '{name}' is already registered"
            )));
        }
        self.by_name.insert(name, self.ordered.len());
        self.ordered.push(extension);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Extension> {
        self.by_name.get(name).map(|&index| &self.ordered[index])
    }

    /// All extensions in insertion order, init extension first.
    pub(crate) fn ordered(&self) -> &[Extension] {
        &self.ordered
    }

    /// User extensions in insertion order (everything after the init
    /// extension).
    pub(crate) fn user_extensions(&self) -> &[Extension] {
        &self.ordered[1..]
    }

    /// Names sorted lexicographically for transport advertisement.
    pub(crate) fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ordered
            .iter()
            .map(|ext| ext.name().to_owned())
            .collect();
        names.sort();
        names
    }
}
