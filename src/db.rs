//! Table handles and flags
//!
//! A [`Database`] is a cheap copyable handle naming one table (a DBI) plus
//! the flags it was opened with. The reserved DBIs are the GC (free-list)
//! table and MAIN, which maps table names to serialized tree records; named
//! tables get DBIs from 2 upward.

use std::borrow::Cow;

use crate::btree;
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::txn::{mode::Mode, Transaction, Write};
use bitflags::bitflags;

/// Numeric handle identifying a table within an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dbi(pub u32);

/// The GC (free-list) table: retired-txnid -> retired page numbers
pub const GC_DBI: Dbi = Dbi(0);

/// The main table: table names -> serialized tree records
pub const MAIN_DBI: Dbi = Dbi(1);

/// First DBI available to named tables
pub const FIRST_USER_DBI: u32 = 2;

bitflags! {
    /// Table flags, persisted in the tree record
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatabaseFlags: u16 {
        /// Keys compare from the last byte backwards
        const REVERSE_KEY = 0x02;
        /// Multiple values per key, held in a nested tree
        const DUP_SORT = 0x04;
        /// Keys are 4- or 8-byte little-endian unsigned integers
        const INTEGER_KEY = 0x08;
        /// All duplicate values have the same size (dense leaves)
        const DUP_FIXED = 0x10;
        /// Duplicate values are little-endian unsigned integers
        const INTEGER_DUP = 0x20;
        /// Duplicate values compare reversed
        const REVERSE_DUP = 0x40;
        /// Create the table if it does not exist (open-time only)
        const CREATE = 0x4000;
        /// Flags stored on disk
        const PERSISTENT = Self::REVERSE_KEY.bits() | Self::DUP_SORT.bits()
            | Self::INTEGER_KEY.bits() | Self::DUP_FIXED.bits()
            | Self::INTEGER_DUP.bits() | Self::REVERSE_DUP.bits();
    }
}

bitflags! {
    /// Write-operation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PutFlags: u16 {
        /// Fail with key-exists instead of overwriting
        const NO_OVERWRITE = 0x01;
        /// For DUP_SORT: fail with key-exists if this exact pair is present
        const NO_DUP_DATA = 0x02;
        /// Key must sort after everything present (fast sequential load)
        const APPEND = 0x04;
        /// For DUP_SORT: value must sort after the key's present values
        const APPEND_DUP = 0x08;
    }
}

/// Key ordering for a table's flags
pub fn key_comparator(flags: u16) -> Comparator {
    let flags = DatabaseFlags::from_bits_truncate(flags);
    if flags.contains(DatabaseFlags::INTEGER_KEY) {
        Comparator::Integer
    } else if flags.contains(DatabaseFlags::REVERSE_KEY) {
        Comparator::Reverse
    } else {
        Comparator::Lexicographic
    }
}

/// Value ordering inside a DUP_SORT table's nested trees
pub fn dup_comparator(flags: u16) -> Comparator {
    let flags = DatabaseFlags::from_bits_truncate(flags);
    if flags.contains(DatabaseFlags::INTEGER_DUP) {
        Comparator::Integer
    } else if flags.contains(DatabaseFlags::REVERSE_DUP) {
        Comparator::Reverse
    } else {
        Comparator::Lexicographic
    }
}

/// A handle to one table
#[derive(Debug, Clone, Copy)]
pub struct Database {
    pub(crate) dbi: Dbi,
    pub(crate) flags: DatabaseFlags,
}

impl Database {
    pub(crate) fn new(dbi: Dbi, flags: DatabaseFlags) -> Self {
        Self { dbi, flags }
    }

    /// The numeric handle
    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    /// Flags the table carries
    pub fn flags(&self) -> DatabaseFlags {
        self.flags
    }

    /// Look up a key; for DUP_SORT tables this returns the first value
    pub fn get<'t, M: Mode>(
        &self,
        txn: &'t Transaction<'_, M>,
        key: &[u8],
    ) -> Result<Option<Cow<'t, [u8]>>> {
        let rec = txn.tree(self.dbi)?;
        btree::get(txn, &rec, key)
    }

    /// Insert or update a key/value pair
    pub fn put(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<()> {
        txn.ensure_active()?;
        let mut rec = txn.tree(self.dbi)?;
        match btree::put(txn, &mut rec, key, value, flags) {
            Ok(_) => txn.set_tree(self.dbi, rec),
            Err(e) => {
                txn.note_error(&e);
                Err(e)
            }
        }
    }

    /// Delete a key, or one duplicate of it when `value` is given.
    /// Returns whether anything was removed.
    pub fn del(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        txn.ensure_active()?;
        let mut rec = txn.tree(self.dbi)?;
        match btree::del(txn, &mut rec, key, value) {
            Ok(removed) => {
                txn.set_tree(self.dbi, rec)?;
                Ok(removed)
            }
            Err(Error::NotFound) => Ok(false),
            Err(e) => {
                txn.note_error(&e);
                Err(e)
            }
        }
    }

    /// Number of duplicate values stored under `key`
    pub fn dup_count<M: Mode>(&self, txn: &Transaction<'_, M>, key: &[u8]) -> Result<u64> {
        let rec = txn.tree(self.dbi)?;
        btree::dup_count(txn, &rec, key)
    }

    /// Number of items in the table
    pub fn entries<M: Mode>(&self, txn: &Transaction<'_, M>) -> Result<u64> {
        Ok(txn.tree(self.dbi)?.entries)
    }

    /// Remove every item, keeping the (empty) table
    pub fn clear(&self, txn: &mut Transaction<'_, Write>) -> Result<()> {
        txn.ensure_active()?;
        match btree::drop_tree(txn, self.dbi, false) {
            Ok(()) => Ok(()),
            Err(e) => {
                txn.note_error(&e);
                Err(e)
            }
        }
    }

    /// Remove every item and delete the table itself
    pub fn drop(&self, txn: &mut Transaction<'_, Write>) -> Result<()> {
        txn.ensure_active()?;
        if self.dbi.0 < FIRST_USER_DBI {
            return Err(Error::InvalidParameter("the system tables cannot be dropped"));
        }
        match btree::drop_tree(txn, self.dbi, true) {
            Ok(()) => Ok(()),
            Err(e) => {
                txn.note_error(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparator_selection() {
        let c = key_comparator(DatabaseFlags::INTEGER_KEY.bits());
        assert!(matches!(c, Comparator::Integer));
        let c = key_comparator(DatabaseFlags::REVERSE_KEY.bits());
        assert!(matches!(c, Comparator::Reverse));
        let c = key_comparator(0);
        assert!(matches!(c, Comparator::Lexicographic));
        let c = dup_comparator((DatabaseFlags::DUP_SORT | DatabaseFlags::REVERSE_DUP).bits());
        assert!(matches!(c, Comparator::Reverse));
    }

    #[test]
    fn test_persistent_mask_excludes_create() {
        assert!(!DatabaseFlags::PERSISTENT.contains(DatabaseFlags::CREATE));
        let on_disk = (DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE) & DatabaseFlags::PERSISTENT;
        assert_eq!(on_disk, DatabaseFlags::DUP_SORT);
    }
}
