//! Durable doubly-linked lists.
//!
//! A list is a heap-resident header {first, last, length, userData}; each
//! element is a node {prev, next, list, data}. The data slot holds an
//! arbitrary location (or plain integer) owned by the caller; deleting an
//! element never frees its data.

use super::heap::{Addr, Txn};
use crate::tools::error::{DtnError, Result};

const LIST_FIRST: u64 = 0;
const LIST_LAST: u64 = 8;
const LIST_LENGTH: u64 = 16;
const LIST_USER: u64 = 24;
const LIST_SIZE: u64 = 32;

const NODE_PREV: u64 = 0;
const NODE_NEXT: u64 = 8;
const NODE_LIST: u64 = 16;
const NODE_DATA: u64 = 24;
const NODE_SIZE: u64 = 32;

impl Txn<'_> {
    /// Create an empty list.
    pub fn list_create(&mut self) -> Result<Addr> {
        let list = self.malloc(LIST_SIZE)?;
        for off in [LIST_FIRST, LIST_LAST, LIST_LENGTH, LIST_USER] {
            self.write_u64(Addr(list.0 + off), 0)?;
        }
        Ok(list)
    }

    /// First element of the list, or null.
    pub fn list_first(&self, list: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(list.0 + LIST_FIRST))?))
    }

    /// Last element of the list, or null.
    pub fn list_last(&self, list: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(list.0 + LIST_LAST))?))
    }

    /// Element after `elt`, or null.
    pub fn list_next(&self, elt: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(elt.0 + NODE_NEXT))?))
    }

    /// Element before `elt`, or null.
    pub fn list_prev(&self, elt: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(elt.0 + NODE_PREV))?))
    }

    /// Data slot of `elt`.
    pub fn list_data(&self, elt: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(elt.0 + NODE_DATA))?))
    }

    /// Overwrite the data slot of `elt`.
    pub fn list_set_data(&mut self, elt: Addr, data: Addr) -> Result<()> {
        self.write_u64(Addr(elt.0 + NODE_DATA), data.0)
    }

    /// The list an element belongs to.
    pub fn list_of(&self, elt: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(elt.0 + NODE_LIST))?))
    }

    /// Number of elements in the list.
    pub fn list_length(&self, list: Addr) -> Result<u64> {
        self.read_u64(Addr(list.0 + LIST_LENGTH))
    }

    /// User-data slot of the list itself.
    pub fn list_user_data(&self, list: Addr) -> Result<Addr> {
        Ok(Addr(self.read_u64(Addr(list.0 + LIST_USER))?))
    }

    /// Overwrite the user-data slot of the list.
    pub fn list_set_user_data(&mut self, list: Addr, data: Addr) -> Result<()> {
        self.write_u64(Addr(list.0 + LIST_USER), data.0)
    }

    fn node_create(&mut self, list: Addr, data: Addr) -> Result<Addr> {
        let node = self.malloc(NODE_SIZE)?;
        self.write_u64(Addr(node.0 + NODE_LIST), list.0)?;
        self.write_u64(Addr(node.0 + NODE_DATA), data.0)?;
        Ok(node)
    }

    fn bump_length(&mut self, list: Addr, delta: i64) -> Result<()> {
        let len = self.read_u64(Addr(list.0 + LIST_LENGTH))?;
        self.write_u64(Addr(list.0 + LIST_LENGTH), len.wrapping_add(delta as u64))
    }

    /// Append `data` at the tail; returns the new element.
    pub fn list_insert_last(&mut self, list: Addr, data: Addr) -> Result<Addr> {
        let node = self.node_create(list, data)?;
        let last = self.list_last(list)?;
        self.write_u64(Addr(node.0 + NODE_PREV), last.0)?;
        self.write_u64(Addr(node.0 + NODE_NEXT), 0)?;
        if last.is_null() {
            self.write_u64(Addr(list.0 + LIST_FIRST), node.0)?;
        } else {
            self.write_u64(Addr(last.0 + NODE_NEXT), node.0)?;
        }
        self.write_u64(Addr(list.0 + LIST_LAST), node.0)?;
        self.bump_length(list, 1)?;
        Ok(node)
    }

    /// Prepend `data` at the head; returns the new element.
    pub fn list_insert_first(&mut self, list: Addr, data: Addr) -> Result<Addr> {
        let node = self.node_create(list, data)?;
        let first = self.list_first(list)?;
        self.write_u64(Addr(node.0 + NODE_PREV), 0)?;
        self.write_u64(Addr(node.0 + NODE_NEXT), first.0)?;
        if first.is_null() {
            self.write_u64(Addr(list.0 + LIST_LAST), node.0)?;
        } else {
            self.write_u64(Addr(first.0 + NODE_PREV), node.0)?;
        }
        self.write_u64(Addr(list.0 + LIST_FIRST), node.0)?;
        self.bump_length(list, 1)?;
        Ok(node)
    }

    /// Insert `data` immediately before `elt`; returns the new element.
    pub fn list_insert_before(&mut self, elt: Addr, data: Addr) -> Result<Addr> {
        let list = self.list_of(elt)?;
        if list.is_null() {
            return Err(DtnError::new(format!("{} is not a list element", elt)));
        }

        let prev = self.list_prev(elt)?;
        let node = self.node_create(list, data)?;
        self.write_u64(Addr(node.0 + NODE_PREV), prev.0)?;
        self.write_u64(Addr(node.0 + NODE_NEXT), elt.0)?;
        self.write_u64(Addr(elt.0 + NODE_PREV), node.0)?;
        if prev.is_null() {
            self.write_u64(Addr(list.0 + LIST_FIRST), node.0)?;
        } else {
            self.write_u64(Addr(prev.0 + NODE_NEXT), node.0)?;
        }
        self.bump_length(list, 1)?;
        Ok(node)
    }

    /// Unlink and free the element. The data slot is untouched.
    pub fn list_delete(&mut self, elt: Addr) -> Result<()> {
        let list = self.list_of(elt)?;
        let prev = self.list_prev(elt)?;
        let next = self.list_next(elt)?;
        if prev.is_null() {
            self.write_u64(Addr(list.0 + LIST_FIRST), next.0)?;
        } else {
            self.write_u64(Addr(prev.0 + NODE_NEXT), next.0)?;
        }
        if next.is_null() {
            self.write_u64(Addr(list.0 + LIST_LAST), prev.0)?;
        } else {
            self.write_u64(Addr(next.0 + NODE_PREV), prev.0)?;
        }
        self.bump_length(list, -1)?;
        self.free(elt)
    }

    /// Delete every element, then the list header. Element data is the
    /// caller's to release beforehand.
    pub fn list_destroy(&mut self, list: Addr) -> Result<()> {
        let mut elt = self.list_first(list)?;
        while !elt.is_null() {
            let next = self.list_next(elt)?;
            self.free(elt)?;
            elt = next;
        }
        self.free(list)
    }

    /// Pop the head element's data, deleting the element. Null if empty.
    pub fn list_pop_first(&mut self, list: Addr) -> Result<Addr> {
        let elt = self.list_first(list)?;
        if elt.is_null() {
            return Ok(Addr::NULL);
        }
        let data = self.list_data(elt)?;
        self.list_delete(elt)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::super::heap::{Addr, Heap};

    #[test]
    fn test_list_ops() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("list.heap"), 8192).unwrap();
        let mut txn = heap.begin();

        let list = txn.list_create().unwrap();
        assert_eq!(txn.list_length(list).unwrap(), 0);
        assert!(txn.list_first(list).unwrap().is_null());

        let e1 = txn.list_insert_last(list, Addr(11)).unwrap();
        let e3 = txn.list_insert_last(list, Addr(33)).unwrap();
        let e2 = txn.list_insert_before(e3, Addr(22)).unwrap();
        let e0 = txn.list_insert_first(list, Addr(1)).unwrap();
        assert_eq!(txn.list_length(list).unwrap(), 4);

        let mut data = Vec::new();
        let mut elt = txn.list_first(list).unwrap();
        while !elt.is_null() {
            data.push(txn.list_data(elt).unwrap().0);
            elt = txn.list_next(elt).unwrap();
        }
        assert_eq!(data, vec![1, 11, 22, 33]);

        assert_eq!(txn.list_prev(e2).unwrap(), e1);
        assert_eq!(txn.list_last(list).unwrap(), e3);

        txn.list_delete(e0).unwrap();
        txn.list_delete(e3).unwrap();
        assert_eq!(txn.list_length(list).unwrap(), 2);
        assert_eq!(txn.list_first(list).unwrap(), e1);
        assert_eq!(txn.list_last(list).unwrap(), e2);

        assert!(txn.list_user_data(list).unwrap().is_null());
        txn.list_set_user_data(list, Addr(77)).unwrap();
        assert_eq!(txn.list_user_data(list).unwrap(), Addr(77));

        assert_eq!(txn.list_pop_first(list).unwrap(), Addr(11));
        assert_eq!(txn.list_pop_first(list).unwrap(), Addr(22));
        assert!(txn.list_pop_first(list).unwrap().is_null());

        txn.list_destroy(list).unwrap();
        txn.commit().unwrap();
    }
}
