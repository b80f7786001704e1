use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::objects::object_string::ObjectString;
use crate::value::Value;

/// Key wrapper for tables keyed by canonical strings. Equality is pointer
/// identity, sound because every key string is interned; hashing uses the
/// string's cached hash so rehashing never re-reads the bytes.
#[derive(Clone, Copy)]
pub struct StrKey(pub *mut ObjectString);

impl PartialEq for StrKey {
    fn eq(&self, other: &StrKey) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for StrKey {}

impl Hash for StrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(unsafe { (*self.0).hash() });
    }
}

/// Identity-keyed table used for module globals, class methods and instance
/// fields.
pub struct Table {
    entries: HashMap<StrKey, Value>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: HashMap::new(),
        }
    }

    /// Inserts or replaces. Returns true when the key was newly inserted.
    pub fn put(&mut self, key: *mut ObjectString, value: Value) -> bool {
        self.entries.insert(StrKey(key), value).is_none()
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        self.entries.get(&StrKey(key)).copied()
    }

    pub fn contains(&self, key: *mut ObjectString) -> bool {
        self.entries.contains_key(&StrKey(key))
    }

    /// Returns true when an entry was removed.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        self.entries.remove(&StrKey(key)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StrKey, &Value)> {
        self.entries.iter()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// The intern table: the one table keyed on raw bytes (plus their hash)
/// instead of pointer identity, since it exists to map bytes to the
/// canonical instance. Entries are weak; the sweep prunes unmarked strings
/// before freeing them.
pub struct InternTable {
    entries: HashMap<Rc<str>, *mut ObjectString>,
}

impl InternTable {
    pub fn new() -> InternTable {
        InternTable {
            entries: HashMap::new(),
        }
    }

    pub fn find(&self, content: &str) -> Option<*mut ObjectString> {
        self.entries.get(content).copied()
    }

    pub fn insert(&mut self, string: *mut ObjectString) {
        let key = Rc::from(unsafe { (*string).content.as_str() });
        self.entries.insert(key, string);
    }

    /// Drops entries whose strings did not survive marking. Must run before
    /// the sweep frees the string bodies.
    pub fn remove_unmarked(&mut self) {
        self.entries
            .retain(|_, &mut string| unsafe { (*string).object.marked });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_manager::ObjectManager;
    use crate::objects::object_string::copy_string;
    use crate::value::{make_number_value, values_equal};

    #[test]
    fn test_put_get_delete() {
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();
        let mut table = Table::new();

        let key = copy_string(&mut manager, &mut intern, "answer");
        assert!(table.put(key, make_number_value(42.0)));
        assert!(!table.put(key, make_number_value(43.0)));
        assert!(values_equal(
            &table.get(key).unwrap(),
            &make_number_value(43.0)
        ));
        assert!(table.delete(key));
        assert!(!table.delete(key));
        assert!(table.get(key).is_none());
    }

    #[test]
    fn test_identity_keys_require_interning() {
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();
        let mut table = Table::new();

        let a = copy_string(&mut manager, &mut intern, "name");
        table.put(a, make_number_value(1.0));
        // A second interned lookup for the same bytes is the same pointer,
        // so it hits the same entry.
        let b = copy_string(&mut manager, &mut intern, "name");
        assert!(table.get(b).is_some());
    }

    #[test]
    fn test_intern_table_prunes_unmarked() {
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();

        let keep = copy_string(&mut manager, &mut intern, "keep");
        let _gone = copy_string(&mut manager, &mut intern, "gone");
        unsafe {
            (*keep).object.marked = true;
        }
        intern.remove_unmarked();
        assert_eq!(intern.len(), 1);
        assert!(intern.find("keep").is_some());
        assert!(intern.find("gone").is_none());
    }
}
