//! Structural equality across table graphs.
//!
//! Argument lists compare position by position. Tables compare by pair
//! membership, so two tables holding the same pairs in a different order are
//! equal. A pair of tables already under comparison further up the stack is
//! assumed equal, which makes cyclic graphs terminate.

use std::collections::HashSet;

use super::{Table, TableId, Value, ValueList};

struct Comparison<'a> {
    left: &'a ValueList,
    right: &'a ValueList,
    in_progress: HashSet<(TableId, TableId)>,
}

impl Comparison<'_> {
    fn values(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Table(ta), Value::Table(tb)) => {
                let key = (ta.id, tb.id);
                if self.in_progress.contains(&key) {
                    return true;
                }
                let (Some(left), Some(right)) = (self.left.table(ta.id), self.right.table(tb.id))
                else {
                    return false;
                };
                self.in_progress.insert(key);
                let equal = self.tables(left, right);
                self.in_progress.remove(&key);
                equal
            }
            (Value::Table(_), _) | (_, Value::Table(_)) => false,
            _ => a == b,
        }
    }

    fn tables(&mut self, left: &Table, right: &Table) -> bool {
        if left.pair_count() != right.pair_count() {
            return false;
        }
        let candidates: Vec<_> = right.pairs().collect();
        let mut used = vec![false; candidates.len()];
        'outer: for (index, (key, value)) in left.pairs().enumerate() {
            // Same position first; tables rebuilt in order usually line up.
            let order = std::iter::once(index).chain((0..candidates.len()).filter(|&i| i != index));
            for slot in order {
                if slot >= candidates.len() || used[slot] {
                    continue;
                }
                let (other_key, other_value) = candidates[slot];
                if self.values(key, other_key) && self.values(value, other_value) {
                    used[slot] = true;
                    continue 'outer;
                }
            }
            return false;
        }
        true
    }
}

impl PartialEq for ValueList {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut comparison = Comparison {
            left: self,
            right: other,
            in_progress: HashSet::new(),
        };
        self.iter()
            .zip(other.iter())
            .all(|(a, b)| comparison.values(a, b))
    }
}

impl ValueList {
    /// Structural equality of one value from each list.
    pub fn value_eq(&self, a: &Value, other: &ValueList, b: &Value) -> bool {
        Comparison {
            left: self,
            right: other,
            in_progress: HashSet::new(),
        }
        .values(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cyclic(list: &mut ValueList, name: &str) -> TableId {
        let t = list.new_table();
        let me = list.reference(t);
        let table = list.table_mut(t).unwrap();
        table.insert("name", name);
        table.insert("self", me);
        t
    }

    #[test]
    fn cyclic_tables_compare_equal() {
        let mut a = ValueList::new();
        let ta = cyclic(&mut a, "x");
        a.push_table(ta);

        let mut b = ValueList::new();
        let tb = cyclic(&mut b, "x");
        b.push_table(tb);

        assert_eq!(a, b);
    }

    #[test]
    fn cyclic_tables_with_different_payload_differ() {
        let mut a = ValueList::new();
        let ta = cyclic(&mut a, "x");
        a.push_table(ta);

        let mut b = ValueList::new();
        let tb = cyclic(&mut b, "y");
        b.push_table(tb);

        assert_ne!(a, b);
    }

    #[test]
    fn pair_order_is_irrelevant() {
        let mut a = ValueList::new();
        let ta = a.new_table();
        a.table_mut(ta).unwrap().insert("k", 1);
        a.table_mut(ta).unwrap().insert("j", 2);
        a.push_table(ta);

        let mut b = ValueList::new();
        let tb = b.new_table();
        b.table_mut(tb).unwrap().insert("j", 2);
        b.table_mut(tb).unwrap().insert("k", 1);
        b.push_table(tb);

        assert_eq!(a, b);
    }

    #[test]
    fn argument_order_matters() {
        let a: ValueList = [Value::from(1), Value::from(2)].into_iter().collect();
        let b: ValueList = [Value::from(2), Value::from(1)].into_iter().collect();
        assert_ne!(a, b);
    }

    #[test]
    fn table_never_equals_scalar() {
        let mut a = ValueList::new();
        let t = a.new_table();
        a.push_table(t);
        let b: ValueList = [Value::Nil].into_iter().collect();
        assert_ne!(a, b);
    }
}
