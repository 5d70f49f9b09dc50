//! Thread-Safe Modbus Data Store
//!
//! This module implements the four data tables a Modbus slave exposes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DataStore                            │
//! │  ┌─────────────┐ ┌─────────────┐ ┌───────────┐ ┌──────────┐ │
//! │  │    Coils    │ │  Discrete   │ │  Holding  │ │  Input   │ │
//! │  │  (bit, rw)  │ │   Inputs    │ │ Registers │ │ Registers│ │
//! │  │   RwLock    │ │ (bit, ro)   │ │ (u16, rw) │ │(u16, ro) │ │
//! │  └─────────────┘ └─────────────┘ └───────────┘ └──────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every table has 65 536 entries, one per address, and its own `RwLock`,
//! so a read of holding registers never waits on a coil write. A single
//! request touches at most one table (Read/Write Multiple Registers takes
//! the holding register lock once for both halves).
//!
//! "Read-only" refers to what clients may do. The device side populates
//! discrete inputs and input registers through the `set_*` methods.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Number of addressable entries in each table.
pub const TABLE_SIZE: usize = 1 << 16;

/// Errors returned by the data store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested range runs past the end of the table
    #[error("address range out of bounds: {address} + {quantity} > 65536")]
    OutOfRange { address: u16, quantity: usize },

    /// A writer panicked while holding the table lock
    #[error("{0} table lock poisoned")]
    Poisoned(&'static str),
}

/// Snapshot of data store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
}

/// The slave's data tables.
#[derive(Debug)]
pub struct DataStore {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,

    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    /// Creates a data store with every coil off and every register zero.
    pub fn new() -> Self {
        Self {
            coils: RwLock::new(vec![false; TABLE_SIZE]),
            discrete_inputs: RwLock::new(vec![false; TABLE_SIZE]),
            holding_registers: RwLock::new(vec![0; TABLE_SIZE]),
            input_registers: RwLock::new(vec![0; TABLE_SIZE]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    // ==================== Coils ====================

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError> {
        self.read(&self.coils, "coils", address, quantity)
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        self.write(&self.coils, "coils", address, values)
    }

    // ==================== Discrete Inputs ====================

    pub fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, StoreError> {
        self.read(&self.discrete_inputs, "discrete inputs", address, quantity)
    }

    /// Device-side update of discrete inputs.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        self.write(&self.discrete_inputs, "discrete inputs", address, values)
    }

    // ==================== Holding Registers ====================

    pub fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, StoreError> {
        self.read(&self.holding_registers, "holding registers", address, quantity)
    }

    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        self.write(&self.holding_registers, "holding registers", address, values)
    }

    /// Writes `values` at `write_address`, then reads `read_quantity`
    /// registers at `read_address`, under one lock acquisition.
    ///
    /// The write happens first, so overlapping ranges read back the new
    /// values.
    pub fn write_read_holding_registers(
        &self,
        write_address: u16,
        values: &[u16],
        read_address: u16,
        read_quantity: u16,
    ) -> Result<Vec<u16>, StoreError> {
        let write_range = checked_range(write_address, values.len())?;
        let read_range = checked_range(read_address, usize::from(read_quantity))?;

        let mut table = self
            .holding_registers
            .write()
            .map_err(|_| StoreError::Poisoned("holding registers"))?;
        table[write_range].copy_from_slice(values);
        let result = table[read_range].to_vec();

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    // ==================== Input Registers ====================

    pub fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, StoreError> {
        self.read(&self.input_registers, "input registers", address, quantity)
    }

    /// Device-side update of input registers.
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        self.write(&self.input_registers, "input registers", address, values)
    }

    /// Returns the current counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Panics on another thread while holding the holding register lock.
    #[cfg(test)]
    pub(crate) fn poison_holding_registers(&self) {
        std::thread::scope(|scope| {
            let result = scope
                .spawn(|| {
                    let _guard = self.holding_registers.write();
                    panic!("writer died holding the lock");
                })
                .join();
            assert!(result.is_err());
        });
    }

    fn read<T: Copy>(
        &self,
        table: &RwLock<Vec<T>>,
        name: &'static str,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<T>, StoreError> {
        let range = checked_range(address, usize::from(quantity))?;
        let table = table.read().map_err(|_| StoreError::Poisoned(name))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(table[range].to_vec())
    }

    fn write<T: Copy>(
        &self,
        table: &RwLock<Vec<T>>,
        name: &'static str,
        address: u16,
        values: &[T],
    ) -> Result<(), StoreError> {
        let range = checked_range(address, values.len())?;
        let mut table = table.write().map_err(|_| StoreError::Poisoned(name))?;
        table[range].copy_from_slice(values);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Converts an address and quantity into a table index range.
fn checked_range(address: u16, quantity: usize) -> Result<Range<usize>, StoreError> {
    let start = usize::from(address);
    let end = start + quantity;
    if end > TABLE_SIZE {
        return Err(StoreError::OutOfRange { address, quantity });
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_store_is_zeroed() {
        let store = DataStore::new();
        assert_eq!(store.read_coils(0, 4).unwrap(), vec![false; 4]);
        assert_eq!(store.read_holding_registers(100, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_write_then_read_coils() {
        let store = DataStore::new();
        store.write_coils(10, &[true, false, true]).unwrap();
        assert_eq!(
            store.read_coils(9, 5).unwrap(),
            vec![false, true, false, true, false]
        );
    }

    #[test]
    fn test_write_then_read_registers() {
        let store = DataStore::new();
        store.write_holding_registers(0xFFFE, &[1, 2]).unwrap();
        assert_eq!(store.read_holding_registers(0xFFFE, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_out_of_range() {
        let store = DataStore::new();
        assert_eq!(
            store.read_input_registers(0xFFFF, 2).unwrap_err(),
            StoreError::OutOfRange {
                address: 0xFFFF,
                quantity: 2
            }
        );
        assert!(store.write_coils(0xFFFF, &[true, true]).is_err());
        // Last address on its own is fine
        assert_eq!(store.read_input_registers(0xFFFF, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_tables_are_independent() {
        let store = DataStore::new();
        store.set_input_registers(5, &[42]).unwrap();
        store.set_discrete_inputs(5, &[true]).unwrap();
        assert_eq!(store.read_holding_registers(5, 1).unwrap(), vec![0]);
        assert_eq!(store.read_coils(5, 1).unwrap(), vec![false]);
        assert_eq!(store.read_input_registers(5, 1).unwrap(), vec![42]);
        assert_eq!(store.read_discrete_inputs(5, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_write_read_overlapping() {
        let store = DataStore::new();
        store.write_holding_registers(0, &[1, 2, 3, 4]).unwrap();
        let values = store
            .write_read_holding_registers(1, &[20, 30], 0, 4)
            .unwrap();
        assert_eq!(values, vec![1, 20, 30, 4]);
    }

    #[test]
    fn test_stats() {
        let store = DataStore::new();
        store.write_coils(0, &[true]).unwrap();
        store.read_coils(0, 1).unwrap();
        store.read_coils(0, 1).unwrap();
        assert_eq!(store.stats(), StoreStats { reads: 2, writes: 1 });
    }

    #[test]
    fn test_poisoned_table() {
        let store = DataStore::new();
        store.poison_holding_registers();

        assert_eq!(
            store.read_holding_registers(0, 1).unwrap_err(),
            StoreError::Poisoned("holding registers")
        );
        assert_eq!(
            store.write_holding_registers(0, &[1]).unwrap_err(),
            StoreError::Poisoned("holding registers")
        );
        assert_eq!(
            store.write_read_holding_registers(0, &[1], 0, 1).unwrap_err(),
            StoreError::Poisoned("holding registers")
        );
        // Other tables have their own locks
        assert_eq!(store.read_input_registers(0, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(DataStore::new());
        let mut handles = vec![];

        for i in 0..8u16 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100u16 {
                    let address = i * 100 + j;
                    store.write_holding_registers(address, &[address]).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let values = store.read_holding_registers(0, 800).unwrap();
        assert!(values.iter().enumerate().all(|(i, v)| *v as usize == i));
    }
}
