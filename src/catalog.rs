//! # Catalog
//!
//! Name→`TableDef` registry. Each `TableDef` is immutable after creation
//! and carries everything a routed tuple needs: its schema, its backing
//! storage, its callback list, and a direct index into the router's
//! `OpChainList` for its delta table (an intentional layering shortcut
//! that avoids a hash lookup per routed tuple).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result, UsageError};
use crate::storage::{StorageKind, Table};
use crate::value::{Schema, Tuple};

/// `fn(tuple, table_name, data)`, invoked synchronously on the runtime
/// thread after a non-duplicate insert into the owning table.
pub type Callback = Arc<dyn Fn(&Tuple, &str) + Send + Sync>;

pub struct TableDef {
    pub name: String,
    pub storage_kind: StorageKind,
    pub schema: Arc<Schema>,
    pub keys: Vec<usize>,
    pub loc_spec_col: Option<usize>,
    pub table: Box<dyn Table>,
    pub callbacks: Vec<Callback>,
    /// Index into the router's slab of `OpChainList`s whose delta table is
    /// this one. `None` until the installer registers at least one rule
    /// anchored here.
    pub op_chain_list: Option<usize>,
}

impl TableDef {
    pub fn new(
        name: String,
        storage_kind: StorageKind,
        schema: Arc<Schema>,
        keys: Vec<usize>,
        table: Box<dyn Table>,
    ) -> Self {
        let loc_spec_col = schema.loc_spec_col();
        TableDef { name, storage_kind, schema, keys, loc_spec_col, table, callbacks: Vec::new(), op_chain_list: None }
    }

    pub fn register_callback(&mut self, cb: Callback) {
        self.callbacks.push(cb);
    }

    pub fn fire_callbacks(&self, tuple: &Tuple) {
        for cb in &self.callbacks {
            cb(tuple, &self.name);
        }
    }
}

/// Name→`TableDef` registry. Table definitions are write-once: a second
/// `define_table` for the same name is a `UsageError`, not an overwrite.
#[derive(Default)]
pub struct Catalog {
    tables: HashMap<String, TableDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog { tables: HashMap::new() }
    }

    pub fn define_table(&mut self, def: TableDef) -> Result<()> {
        if self.tables.contains_key(&def.name) {
            return Err(Error::Usage(UsageError::DuplicateTable(def.name.clone())));
        }
        self.tables.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TableDef> {
        self.tables.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableDef)> {
        self.tables.iter()
    }

    pub fn set_op_chain_list(&mut self, name: &str, idx: usize) {
        if let Some(def) = self.tables.get_mut(name) {
            def.op_chain_list = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemTable;
    use crate::value::DataType;

    fn make_def(name: &str) -> TableDef {
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        TableDef::new(name.to_string(), StorageKind::Memory, schema, vec![0], Box::new(MemTable::new()))
    }

    #[test]
    fn define_then_lookup() {
        let mut cat = Catalog::new();
        cat.define_table(make_def("t")).unwrap();
        assert!(cat.get("t").is_some());
        assert!(cat.get("missing").is_none());
    }

    #[test]
    fn rejects_duplicate_definition() {
        let mut cat = Catalog::new();
        cat.define_table(make_def("t")).unwrap();
        let err = cat.define_table(make_def("t")).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::DuplicateTable(_))));
    }
}
