//! Per-CPU lite journals.
//!
//! Each CPU owns one 4 KiB page treated as a circular buffer of 32 B undo
//! records, plus a cacheline-striped head/tail pair. Staging a record
//! publishes the new tail; `head != tail` at mount means the transaction
//! never committed and its undos are replayed.
use std::mem::size_of;
use std::sync::{Mutex, MutexGuard};

use log::*;
use zerocopy::AsBytes;

use crate::bytefs_lib::layout::{
    FsLayout, LiteJournalEntry, BLOCK_SHIFT, BLOCK_SIZE, INODE_SIZE, JOURNAL_ENTRY,
    JOURNAL_ENTRY_SIZE, JOURNAL_INODE, MAX_JOURNAL_LENGTH,
};
use crate::bytefs_lib::pm::PmDevice;
use crate::bytefs_lib::types::{FsError, FsResult};

pub struct LiteJournal {
    layout: FsLayout,
    locks: Vec<Mutex<()>>,
}

/// An open transaction. Holds the CPU's journal lock, so at most one is
/// outstanding per CPU.
pub struct JournalHandle<'a> {
    journal: &'a LiteJournal,
    cpu: u32,
    head: u64,
    tail: u64,
    count: usize,
    _guard: MutexGuard<'a, ()>,
}

impl LiteJournal {
    pub fn new(layout: FsLayout) -> Self {
        let locks = (0..layout.cpus).map(|_| Mutex::new(())).collect();
        Self { layout, locks }
    }

    fn page_base(&self, cpu: u32) -> u64 {
        self.layout.journal_data_block(cpu) << BLOCK_SHIFT
    }

    fn next_slot(&self, cpu: u32, slot: u64) -> u64 {
        let base = self.page_base(cpu);
        base + ((slot - base + JOURNAL_ENTRY_SIZE as u64) % BLOCK_SIZE as u64)
    }

    fn read_pair(&self, pm: &PmDevice, cpu: u32) -> FsResult<(u64, u64)> {
        let addr = self.layout.journal_ptr_addr(cpu);
        let mut bytes = [0u8; 16];
        pm.read_bytes(addr, &mut bytes)?;
        Ok((
            u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            u64::from_le_bytes(bytes[8..].try_into().unwrap()),
        ))
    }

    fn write_head(&self, pm: &PmDevice, cpu: u32, head: u64) -> FsResult<()> {
        let addr = self.layout.journal_ptr_addr(cpu);
        pm.scoped_write(addr, &head.to_le_bytes(), true)
    }

    fn write_tail(&self, pm: &PmDevice, cpu: u32, tail: u64) -> FsResult<()> {
        let addr = self.layout.journal_ptr_addr(cpu) + 8;
        pm.scoped_write(addr, &tail.to_le_bytes(), true)
    }

    /// Format every per-CPU journal: empty ring, head == tail == page base.
    pub fn hard_init(&self, pm: &PmDevice) -> FsResult<()> {
        for cpu in 0..self.layout.cpus {
            let base = self.page_base(cpu);
            let _window = pm.unlock();
            pm.memset(base, 0, BLOCK_SIZE)?;
            pm.flush(base, BLOCK_SIZE, false)?;
            drop(_window);
            self.write_head(pm, cpu, base)?;
            self.write_tail(pm, cpu, base)?;
        }
        Ok(())
    }

    /// Open a transaction on `cpu`.
    pub fn begin(&self, pm: &PmDevice, cpu: u32) -> FsResult<JournalHandle<'_>> {
        let cpu = cpu % self.layout.cpus;
        let guard = self.locks[cpu as usize].lock().unwrap();
        let (head, tail) = self.read_pair(pm, cpu)?;
        if head != tail {
            error!(
                "journal cpu {}: begin with pending transaction (head {:#x}, tail {:#x})",
                cpu, head, tail
            );
            return Err(FsError::Corrupt);
        }
        Ok(JournalHandle {
            journal: self,
            cpu,
            head,
            tail,
            count: 0,
            _guard: guard,
        })
    }

    fn apply_undo(&self, pm: &PmDevice, record: &LiteJournalEntry) -> FsResult<()> {
        match record.j_type {
            JOURNAL_INODE => {
                let mut inode = [0u8; INODE_SIZE];
                pm.read_bytes(record.data2, &mut inode)?;
                pm.scoped_write(record.data1, &inode, true)?;
            }
            JOURNAL_ENTRY => {
                pm.scoped_write(record.data1, &record.data2.to_le_bytes(), true)?;
            }
            other => {
                error!("journal record with unknown type {}", other);
                return Err(FsError::Corrupt);
            }
        }
        Ok(())
    }

    fn collect_pending(
        &self,
        pm: &PmDevice,
        cpu: u32,
        head: u64,
        tail: u64,
    ) -> FsResult<Vec<LiteJournalEntry>> {
        let mut records = vec![];
        let mut slot = head;
        while slot != tail {
            let record: LiteJournalEntry = pm.read_typed(slot)?;
            if !record.csum_ok() {
                error!("journal cpu {}: record at {:#x} fails its checksum", cpu, slot);
                return Err(FsError::Corrupt);
            }
            records.push(record);
            slot = self.next_slot(cpu, slot);
            if records.len() > MAX_JOURNAL_LENGTH {
                return Err(FsError::Corrupt);
            }
        }
        Ok(records)
    }

    /// Mount-time recovery. Returns how many CPUs had a pending transaction
    /// replayed; a checksum failure fails the mount.
    pub fn recover(&self, pm: &PmDevice) -> FsResult<u32> {
        let mut replayed = 0;
        for cpu in 0..self.layout.cpus {
            let _guard = self.locks[cpu as usize].lock().unwrap();
            let (head, tail) = self.read_pair(pm, cpu)?;
            if head == tail {
                continue;
            }
            info!(
                "journal cpu {}: pending transaction (head {:#x}, tail {:#x}), undoing",
                cpu, head, tail
            );
            let records = self.collect_pending(pm, cpu, head, tail)?;
            // undo in reverse staging order
            for record in records.iter().rev() {
                self.apply_undo(pm, record)?;
            }
            self.write_tail(pm, cpu, head)?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

impl<'a> JournalHandle<'a> {
    fn append(&mut self, pm: &PmDevice, j_type: u64, data1: u64, data2: u64) -> FsResult<()> {
        if self.count + 1 >= MAX_JOURNAL_LENGTH {
            error!("journal cpu {}: transaction too long", self.cpu);
            return Err(FsError::Invalid);
        }
        let mut record = LiteJournalEntry {
            j_type,
            data1,
            data2,
            padding: 0,
            csum: 0,
        };
        record.update_csum();
        pm.scoped_write(self.tail, record.as_bytes(), true)?;
        self.tail = self.journal.next_slot(self.cpu, self.tail);
        self.journal.write_tail(pm, self.cpu, self.tail)?;
        self.count += 1;
        Ok(())
    }

    /// Stage an inode undo: on abort the replica copy is written over the
    /// primary.
    pub fn stage_inode(&mut self, pm: &PmDevice, pi_addr: u64, alter_pi_addr: u64) -> FsResult<()> {
        self.append(pm, JOURNAL_INODE, pi_addr, alter_pi_addr)
    }

    /// Stage an 8-byte-word undo, recording its current value.
    pub fn stage_word(&mut self, pm: &PmDevice, addr: u64) -> FsResult<()> {
        let mut old = [0u8; 8];
        pm.read_bytes(addr, &mut old)?;
        self.append(pm, JOURNAL_ENTRY, addr, u64::from_le_bytes(old))
    }

    /// Stage undos for an inode's log tails; the replica tail only when the
    /// caller mirrors metadata.
    pub fn stage_inode_tails(
        &mut self,
        pm: &PmDevice,
        pi_addr: u64,
        metadata_csum: bool,
    ) -> FsResult<()> {
        let tail_addr = pi_addr + crate::get_offset!(crate::bytefs_lib::layout::Inode, log_tail) as u64;
        self.stage_word(pm, tail_addr)?;
        if metadata_csum {
            let alter_addr =
                pi_addr + crate::get_offset!(crate::bytefs_lib::layout::Inode, alter_log_tail) as u64;
            self.stage_word(pm, alter_addr)?;
        }
        Ok(())
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Publish: the mutations protected by this transaction are durable,
    /// drop the undo records.
    pub fn commit(self, pm: &PmDevice) -> FsResult<()> {
        self.journal.write_head(pm, self.cpu, self.tail)?;
        Ok(())
    }

    /// Roll back right now: apply the undos and reset the ring.
    pub fn abort(self, pm: &PmDevice) -> FsResult<()> {
        warn!("journal cpu {}: aborting transaction", self.cpu);
        let records = self
            .journal
            .collect_pending(pm, self.cpu, self.head, self.tail)?;
        for record in records.iter().rev() {
            self.journal.apply_undo(pm, record)?;
        }
        self.journal.write_tail(pm, self.cpu, self.head)?;
        Ok(())
    }
}

const _: () = assert!(BLOCK_SIZE / size_of::<LiteJournalEntry>() == MAX_JOURNAL_LENGTH);

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;

    fn setup(cpus: u32) -> (PmDevice, LiteJournal) {
        let layout = FsLayout::new(cpus, 1024);
        let driver = Arc::new(RamSsdDriver::new(1024 << BLOCK_SHIFT));
        let pm = PmDevice::new(driver, false).unwrap();
        let journal = LiteJournal::new(layout);
        journal.hard_init(&pm).unwrap();
        (pm, journal)
    }

    #[test]
    fn committed_transaction_survives_recovery() -> Result<()> {
        let (pm, journal) = setup(2);
        let target = 900u64 << BLOCK_SHIFT;
        pm.scoped_write(target, &1u64.to_le_bytes(), true)?;

        let mut txn = journal.begin(&pm, 0)?;
        txn.stage_word(&pm, target)?;
        pm.scoped_write(target, &2u64.to_le_bytes(), true)?;
        txn.commit(&pm)?;

        // recovery is a no-op on a committed journal
        assert_eq!(journal.recover(&pm)?, 0);
        let mut word = [0u8; 8];
        pm.read_bytes(target, &mut word)?;
        assert_eq!(u64::from_le_bytes(word), 2);
        Ok(())
    }

    #[test]
    fn uncommitted_transaction_is_undone() -> Result<()> {
        let (pm, journal) = setup(2);
        let target = 901u64 << BLOCK_SHIFT;
        pm.scoped_write(target, &0xaau64.to_le_bytes(), true)?;

        let mut txn = journal.begin(&pm, 1)?;
        txn.stage_word(&pm, target)?;
        pm.scoped_write(target, &0xbbu64.to_le_bytes(), true)?;
        // crash before commit: drop the handle without committing
        drop(txn);

        assert_eq!(journal.recover(&pm)?, 1);
        let mut word = [0u8; 8];
        pm.read_bytes(target, &mut word)?;
        assert_eq!(u64::from_le_bytes(word), 0xaa);
        // ring is empty again
        let txn = journal.begin(&pm, 1)?;
        txn.commit(&pm)?;
        Ok(())
    }

    #[test]
    fn inode_record_restores_primary_from_replica() -> Result<()> {
        let (pm, journal) = setup(1);
        let primary = 902u64 << BLOCK_SHIFT;
        let replica = 903u64 << BLOCK_SHIFT;
        pm.scoped_write(primary, &[1u8; INODE_SIZE], true)?;
        pm.scoped_write(replica, &[1u8; INODE_SIZE], true)?;

        let mut txn = journal.begin(&pm, 0)?;
        txn.stage_inode(&pm, primary, replica)?;
        // scribble over the primary, then "crash"
        pm.scoped_write(primary, &[9u8; INODE_SIZE], true)?;
        drop(txn);

        journal.recover(&pm)?;
        let mut buf = [0u8; INODE_SIZE];
        pm.read_bytes(primary, &mut buf)?;
        assert_eq!(buf, [1u8; INODE_SIZE]);
        Ok(())
    }

    #[test]
    fn abort_rolls_back_immediately() -> Result<()> {
        let (pm, journal) = setup(1);
        let target = 904u64 << BLOCK_SHIFT;
        pm.scoped_write(target, &7u64.to_le_bytes(), true)?;
        let mut txn = journal.begin(&pm, 0)?;
        txn.stage_word(&pm, target)?;
        pm.scoped_write(target, &8u64.to_le_bytes(), true)?;
        txn.abort(&pm)?;
        let mut word = [0u8; 8];
        pm.read_bytes(target, &mut word)?;
        assert_eq!(u64::from_le_bytes(word), 7);
        // journal reusable after abort
        let txn = journal.begin(&pm, 0)?;
        txn.commit(&pm)?;
        Ok(())
    }

    #[test]
    fn corrupt_record_fails_recovery() -> Result<()> {
        let (pm, journal) = setup(1);
        let target = 905u64 << BLOCK_SHIFT;
        let mut txn = journal.begin(&pm, 0)?;
        txn.stage_word(&pm, target)?;
        let slot = txn.head;
        drop(txn);
        // flip a byte inside the staged record
        let mut byte = [0u8; 1];
        pm.read_bytes(slot + 4, &mut byte)?;
        pm.scoped_write(slot + 4, &[byte[0] ^ 0x01], true)?;
        assert_eq!(journal.recover(&pm), Err(FsError::Corrupt));
        Ok(())
    }

    #[test]
    fn transaction_length_bounded() -> Result<()> {
        let (pm, journal) = setup(1);
        let target = 906u64 << BLOCK_SHIFT;
        let mut txn = journal.begin(&pm, 0)?;
        for _ in 0..MAX_JOURNAL_LENGTH - 1 {
            txn.stage_word(&pm, target)?;
        }
        assert_eq!(txn.stage_word(&pm, target), Err(FsError::Invalid));
        txn.abort(&pm)?;
        Ok(())
    }
}
