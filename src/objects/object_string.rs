use std::cell::Cell;

use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_manager::ObjectManager;
use crate::table::InternTable;

/// An immutable string. The hash is computed lazily on first demand and
/// cached; 0 is the "not yet hashed" sentinel (a real hash of 0 is nudged
/// to 1).
#[repr(C)]
pub struct ObjectString {
    pub object: Object,
    pub content: String,
    pub interned: bool,
    hash: Cell<u32>,
}

impl ObjectString {
    pub fn new(content: String) -> Box<ObjectString> {
        Box::new(ObjectString {
            object: Object::new(ObjectKind::ObjString),
            content,
            interned: false,
            hash: Cell::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn hash(&self) -> u32 {
        let cached = self.hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hash = hash_bytes(self.content.as_bytes());
        if hash == 0 {
            hash = 1;
        }
        self.hash.set(hash);
        hash
    }
}

/// FNV-1a, 32 bits.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Interning entry point: returns the canonical instance for `content`,
/// allocating and registering one if none exists yet.
pub fn copy_string(
    manager: &mut ObjectManager,
    intern: &mut InternTable,
    content: &str,
) -> *mut ObjectString {
    if let Some(existing) = intern.find(content) {
        return existing;
    }
    let string = manager.alloc_string(content.to_string());
    unsafe {
        (*string).interned = true;
    }
    intern.insert(string);
    string
}

/// Ownership-transferring variant of [`copy_string`]: identical byte content
/// yields the same canonical instance, the owned buffer is dropped on a hit.
pub fn take_string(
    manager: &mut ObjectManager,
    intern: &mut InternTable,
    content: String,
) -> *mut ObjectString {
    if let Some(existing) = intern.find(content.as_str()) {
        return existing;
    }
    let string = manager.alloc_string(content);
    unsafe {
        (*string).interned = true;
    }
    intern.insert(string);
    string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_cached_and_nonzero() {
        let string = ObjectString::new("hello".to_string());
        let first = string.hash();
        assert_ne!(first, 0);
        assert_eq!(string.hash(), first);

        let empty = ObjectString::new(String::new());
        assert_ne!(empty.hash(), 0);
    }

    #[test]
    fn test_copy_string_interns() {
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();

        let a = copy_string(&mut manager, &mut intern, "interned");
        let b = copy_string(&mut manager, &mut intern, "interned");
        let c = copy_string(&mut manager, &mut intern, "other");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, c));
        assert_eq!(intern.len(), 2);
    }

    #[test]
    fn test_take_string_matches_copy_string() {
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();

        let a = copy_string(&mut manager, &mut intern, "shared");
        let b = take_string(&mut manager, &mut intern, "shared".to_string());
        assert!(std::ptr::eq(a, b));
    }
}
