use std::collections::HashMap;

use super::{ForeignHandle, TableId, TableRef, Value};
use crate::callable::Callable;

/// Body of one table: alternating key/value entries.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Value>,
    claimed: bool,
}

impl Table {
    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.entries.push(value);
    }

    /// Append a key/value pair.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.entries.push(key.into());
        self.entries.push(value.into());
    }

    /// Key/value pairs. An odd-length body is malformed and yields nothing.
    pub fn pairs(&self) -> impl Iterator<Item = (&Value, &Value)> + '_ {
        let usable = if self.entries.len() % 2 == 0 {
            &self.entries[..]
        } else {
            &self.entries[..0]
        };
        usable.chunks_exact(2).map(|pair| (&pair[0], &pair[1]))
    }

    pub fn pair_count(&self) -> usize {
        if self.entries.len() % 2 == 0 {
            self.entries.len() / 2
        } else {
            0
        }
    }

    /// Value stored under `key`, compared with derived value equality.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Drop pairs whose key is nil. Returns the number of pairs removed.
    pub fn validate_keys(&mut self) -> usize {
        if self.entries.len() % 2 != 0 {
            let dropped = self.entries.len() / 2;
            self.entries.clear();
            return dropped;
        }
        let before = self.entries.len();
        let mut kept = Vec::with_capacity(before);
        let mut drain = std::mem::take(&mut self.entries).into_iter();
        while let (Some(key), Some(value)) = (drain.next(), drain.next()) {
            if !key.is_nil() {
                kept.push(key);
                kept.push(value);
            }
        }
        self.entries = kept;
        (before - self.entries.len()) / 2
    }
}

/// Ordered list of values plus the arena of every table they reach.
///
/// As an argument list the order of [`values`](Self::iter) is significant.
/// Tables created through [`new_table`](Self::new_table) are addressed by
/// [`TableId`] and only meaningful within this list.
#[derive(Debug, Clone, Default)]
pub struct ValueList {
    values: Vec<Value>,
    tables: Vec<Table>,
}

impl ValueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.values.push(value.into());
    }

    pub fn push_nil(&mut self) {
        self.values.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.values.push(Value::Boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.values.push(Value::Number(n));
    }

    pub fn push_string(&mut self, s: impl Into<Vec<u8>>) {
        self.values.push(Value::String(s.into()));
    }

    pub fn push_handle(&mut self, handle: ForeignHandle) {
        self.values.push(Value::Handle(handle));
    }

    pub fn push_callable(&mut self, callable: Callable) {
        self.values.push(Value::Callable(callable));
    }

    /// Push a reference to an arena table.
    pub fn push_table(&mut self, id: TableId) {
        let value = self.reference(id);
        self.values.push(value);
    }

    /// Remove and return the last value. Tables it referenced stay in the arena.
    pub fn pop(&mut self) -> Option<Value> {
        self.values.pop()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.tables.clear();
    }

    // ========================================================================
    // Table arena
    // ========================================================================

    /// Allocate an empty table in the arena.
    pub fn new_table(&mut self) -> TableId {
        let id = TableId(self.tables.len() as u32);
        self.tables.push(Table::default());
        id
    }

    /// A slot value for `id`. The first reference handed out owns the table.
    pub fn reference(&mut self, id: TableId) -> Value {
        let owned = match self.tables.get_mut(id.index()) {
            Some(table) => !std::mem::replace(&mut table.claimed, true),
            None => false,
        };
        Value::Table(TableRef { id, owned })
    }

    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index())
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id.index())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Table body behind a value, when the value is a table slot.
    pub fn table_of(&self, value: &Value) -> Option<&Table> {
        value.as_table().and_then(|id| self.table(id))
    }

    /// Deep-copy `value` out of `source` into this list's arena.
    ///
    /// `known` maps source tables to their copies and keeps shared and
    /// cyclic tables shared in the copy. Use one map per copy operation.
    pub fn import(
        &mut self,
        source: &ValueList,
        value: &Value,
        known: &mut HashMap<TableId, TableId>,
    ) -> Value {
        let Value::Table(table) = value else {
            return value.clone();
        };
        if let Some(&copy) = known.get(&table.id) {
            return self.reference(copy);
        }
        let Some(body) = source.table(table.id) else {
            return Value::Nil;
        };
        let copy = self.new_table();
        known.insert(table.id, copy);
        let reference = self.reference(copy);
        for entry in body.entries() {
            let imported = self.import(source, entry, known);
            if let Some(target) = self.table_mut(copy) {
                target.push(imported);
            }
        }
        reference
    }

    /// Copy every value of `source` onto the end of this list.
    pub fn extend_from(&mut self, source: &ValueList) {
        let mut known = HashMap::new();
        for value in source.iter() {
            let imported = self.import(source, value, &mut known);
            self.values.push(imported);
        }
    }

    /// Run [`Table::validate_keys`] on every arena table.
    pub fn validate_keys(&mut self) -> usize {
        self.tables.iter_mut().map(Table::validate_keys).sum()
    }
}

impl<'a> IntoIterator for &'a ValueList {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl FromIterator<Value> for ValueList {
    /// Collect scalar values. Table slots are meaningless without their
    /// arena, so only use this with values that are not tables.
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
            tables: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reference_owns() {
        let mut list = ValueList::new();
        let t = list.new_table();
        list.push_table(t);
        list.push_table(t);
        assert!(!list.get(0).unwrap().is_weak());
        assert!(list.get(1).unwrap().is_weak());
    }

    #[test]
    fn odd_table_has_no_pairs() {
        let mut list = ValueList::new();
        let t = list.new_table();
        let table = list.table_mut(t).unwrap();
        table.insert("a", 1);
        table.push(Value::Boolean(true));
        assert_eq!(table.pairs().count(), 0);
        assert_eq!(table.pair_count(), 0);
    }

    #[test]
    fn validate_keys_drops_nil_keys() {
        let mut list = ValueList::new();
        let t = list.new_table();
        let table = list.table_mut(t).unwrap();
        table.insert("a", 1);
        table.insert(Value::Nil, 2);
        table.insert("b", 3);
        assert_eq!(table.validate_keys(), 1);
        assert_eq!(table.pair_count(), 2);
        assert_eq!(table.get(&Value::from("b")), Some(&Value::Number(3.0)));
    }

    #[test]
    fn import_keeps_cycles_shared() {
        let mut source = ValueList::new();
        let t = source.new_table();
        let self_ref = source.reference(t);
        source.table_mut(t).unwrap().insert("self", self_ref);
        source.push_table(t);

        let mut copy = ValueList::new();
        copy.extend_from(&source);
        assert_eq!(copy.table_count(), 1);
        let root = copy.get(0).unwrap().as_table().unwrap();
        let inner = copy.table(root).unwrap().get(&Value::from("self")).unwrap();
        assert_eq!(inner.as_table(), Some(root));
        assert_eq!(copy, source);
    }

    #[test]
    fn pop_returns_last() {
        let mut list = ValueList::new();
        list.push_number(1.0);
        list.push_string("two");
        assert_eq!(list.pop(), Some(Value::from("two")));
        assert_eq!(list.len(), 1);
    }
}
