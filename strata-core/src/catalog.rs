use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::{Error, FileMigration, Migration, Result, RevisionId};

/// Every migration known to the application, indexed by revision id.
///
/// The catalog owns the migrations but knows nothing about graph shape;
/// ordering and reachability live in [`RevisionGraph`](crate::RevisionGraph),
/// which borrows from it.
#[derive(Default)]
pub struct Catalog {
    migrations: Vec<Box<dyn Migration>>,
    index: HashMap<RevisionId, usize>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field(
                "migrations",
                &self
                    .migrations
                    .iter()
                    .map(|migration| migration.revision())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration. Revision ids must be unique across the
    /// catalog.
    pub fn add(&mut self, migration: Box<dyn Migration>) -> Result<()> {
        let id = migration.revision();

        if self.index.contains_key(&id) {
            return Err(Error::InvalidCatalog(format!(
                "duplicate revision id `{id}`"
            )));
        }

        self.index.insert(id, self.migrations.len());
        self.migrations.push(migration);

        Ok(())
    }

    /// Load every `*.json` migration file in `dir`, in file-name order.
    ///
    /// File-name order only affects iteration; execution order is always
    /// derived from the parent links.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut paths = fs::read_dir(dir.as_ref())?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();

        paths.sort();

        let mut catalog = Self::new();

        for path in paths {
            catalog.add(Box::new(FileMigration::load(&path)?))?;
        }

        Ok(catalog)
    }

    pub fn get(&self, id: &RevisionId) -> Option<&dyn Migration> {
        self.index
            .get(id)
            .map(|&position| self.migrations[position].as_ref())
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|migration| migration.as_ref())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
