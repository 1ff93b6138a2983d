use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{
    Authorizations, DATATYPE_FILTER, Key, Range, Scanner, Store, StoreError, StoreResult,
};

type Table = BTreeMap<Key, Bytes>;

/// In-memory sorted store. Scanners read a snapshot taken when they open,
/// so writes never disturb a running scan.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table: &str) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Table::new()));
    }

    pub fn put(&self, table: &str, key: Key, value: impl Into<Bytes>) {
        let mut tables = self.tables.write();
        let data = tables
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Table::new()));
        Arc::make_mut(data).insert(key, value.into());
    }

    pub fn get(&self, table: &str, key: &Key) -> Option<Bytes> {
        self.tables.read().get(table)?.get(key).cloned()
    }

    /// Number of entries in `table`, 0 when it does not exist.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Make every scanner open on `table` fail until restored.
    pub fn set_unavailable(&self, table: &str, unavailable: bool) {
        let mut tables = self.unavailable.write();
        if unavailable {
            tables.insert(table.to_string());
        } else {
            tables.remove(table);
        }
    }
}

impl Store for MemoryStore {
    fn open_scanner(&self, table: &str, _auths: &Authorizations) -> StoreResult<Box<dyn Scanner>> {
        if self.unavailable.read().contains(table) {
            return Err(StoreError::Unavailable(table.to_string()));
        }
        let data = self
            .tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(Box::new(MemoryScanner::new(data)))
    }
}

struct MemoryScanner {
    data: Arc<Table>,
    range: Option<Range>,
    families: HashSet<String>,
    datatypes: Option<HashSet<String>>,
    /// Last key returned; iteration resumes strictly after it.
    cursor: Option<Bound<Key>>,
}

impl MemoryScanner {
    fn new(data: Arc<Table>) -> Self {
        Self {
            data,
            range: None,
            families: HashSet::new(),
            datatypes: None,
            cursor: None,
        }
    }

    fn accepts(&self, key: &Key) -> bool {
        if !self.families.is_empty() && !self.families.contains(&key.family) {
            return false;
        }
        match &self.datatypes {
            Some(types) => key
                .qualifier
                .rsplit_once('\0')
                .is_some_and(|(_, datatype)| types.contains(datatype)),
            None => true,
        }
    }

    fn lower_bound(&self) -> Bound<Key> {
        if let Some(cursor) = &self.cursor {
            return cursor.clone();
        }
        match &self.range {
            Some(range) if range.start_inclusive() => Bound::Included(range.start().clone()),
            Some(range) => Bound::Excluded(range.start().clone()),
            None => Bound::Unbounded,
        }
    }
}

impl Scanner for MemoryScanner {
    fn set_range(&mut self, range: Range) {
        self.range = Some(range);
        self.cursor = None;
    }

    fn fetch_column(&mut self, family: &str) {
        self.families.insert(family.to_string());
    }

    fn add_server_side_filter(
        &mut self,
        name: &str,
        options: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        if name != DATATYPE_FILTER {
            return Err(StoreError::UnknownFilter(name.to_string()));
        }
        let types = options
            .get("types")
            .ok_or_else(|| StoreError::MissingFilterOption {
                filter: name.to_string(),
                option: "types".to_string(),
            })?;
        self.datatypes = Some(
            types
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        );
        Ok(())
    }

    fn seek(&mut self, key: &Key) -> StoreResult<()> {
        let target = match &self.range {
            Some(range) if range.before_start(key) => return Ok(()),
            _ => key.clone(),
        };
        // Never move backwards past an entry already returned.
        let behind = match &self.cursor {
            Some(Bound::Excluded(last)) | Some(Bound::Included(last)) => &target <= last,
            _ => false,
        };
        if !behind {
            self.cursor = Some(Bound::Included(target));
        }
        Ok(())
    }

    fn next_entry(&mut self) -> StoreResult<Option<(Key, Bytes)>> {
        let lower = self.lower_bound();
        let found = self
            .data
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| self.range.as_ref().is_none_or(|range| !range.after_end(key)))
            .find(|(key, _)| self.accepts(key))
            .map(|(key, value)| (key.clone(), value.clone()));

        match &found {
            Some((key, _)) => self.cursor = Some(Bound::Excluded(key.clone())),
            None => {
                if let Some(end) = self.range.as_ref().and_then(Range::end) {
                    self.cursor = Some(Bound::Included(end.clone()));
                }
            }
        }
        Ok(found)
    }
}
