use serde::{Deserialize, Serialize};

use crate::errors::ResourceType;

/// Countable capacity of one cluster.
///
/// `cpu_cores` and `storage_gb` are reported but never decremented; only
/// slots and memory blocks are reserved per VM. Mutation goes through
/// `resource_checkout` / `resource_return` and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLedger {
    vm_slots: u32,
    cpu_cores: u32,
    storage_gb: u64,
    memory_blocks: Vec<u64>,
}

impl CapacityLedger {
    pub fn new(vm_slots: u32, cpu_cores: u32, storage_gb: u64, memory_blocks: Vec<u64>) -> Self {
        Self {
            vm_slots,
            cpu_cores,
            storage_gb,
            memory_blocks,
        }
    }

    pub fn vm_slots(&self) -> u32 {
        self.vm_slots
    }

    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }

    pub fn storage_gb(&self) -> u64 {
        self.storage_gb
    }

    pub fn memory_blocks(&self) -> &[u64] {
        &self.memory_blocks
    }

    /// Lowest index of a block with at least `memory_mb` free.
    pub fn find_memory_entry(&self, memory_mb: u64) -> Option<usize> {
        self.memory_blocks.iter().position(|&free| free >= memory_mb)
    }

    pub fn can_host(&self, memory_mb: u64) -> bool {
        self.vm_slots > 0 && self.find_memory_entry(memory_mb).is_some()
    }

    /// Takes one slot and `memory_mb` out of the first block that fits.
    /// Leaves the ledger untouched on failure.
    pub fn resource_checkout(&mut self, memory_mb: u64) -> Result<usize, ResourceType> {
        if self.vm_slots == 0 {
            return Err(ResourceType::Slots);
        }
        let entry = self
            .find_memory_entry(memory_mb)
            .ok_or(ResourceType::Memory)?;

        self.vm_slots -= 1;
        self.memory_blocks[entry] -= memory_mb;
        Ok(entry)
    }

    /// Gives a reservation back to the block it came from. Returns false if
    /// the index does not exist, which would mean the record was corrupted.
    pub fn resource_return(&mut self, entry: usize, memory_mb: u64) -> bool {
        match self.memory_blocks.get_mut(entry) {
            Some(block) => {
                *block += memory_mb;
                self.vm_slots += 1;
                true
            }
            None => false,
        }
    }
}
