use crate::blockstore_meta::SlotMeta;
use bitflags::bitflags;
use log::info;
use lru::LruCache;
use solana_clock::Slot;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

bitflags! {
    #[derive(Copy, Clone, Default)]
    struct SlotFlags: u8 {
        const DEAD   = 0b00000001;
        const FULL   = 0b00000010;
        const ROOTED = 0b00000100;
    }
}

/// Where a shred arrived from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShredSource {
    Turbine,
    Repaired,
    Recovered,
}

#[derive(Clone, Default)]
pub struct SlotStats {
    turbine_fec_set_index_counts: HashMap</*fec_set_index*/ u32, /*count*/ usize>,
    num_repaired: usize,
    num_recovered: usize,
    last_index: u64,
    flags: SlotFlags,
}

impl SlotStats {
    fn num_turbine(&self) -> usize {
        self.turbine_fec_set_index_counts.values().sum()
    }

    fn report(&self, slot: Slot, reason: &str) {
        info!(
            "slot_stats: slot: {slot}, reason: {reason}, last_index: {}, num_turbine: {}, \
             num_repaired: {}, num_recovered: {}, is_full: {}, is_dead: {}, is_rooted: {}",
            self.last_index,
            self.num_turbine(),
            self.num_repaired,
            self.num_recovered,
            self.flags.contains(SlotFlags::FULL),
            self.flags.contains(SlotFlags::DEAD),
            self.flags.contains(SlotFlags::ROOTED),
        );
    }
}

pub struct SlotsStats {
    pub stats: Mutex<LruCache<Slot, SlotStats>>,
}

const SLOTS_STATS_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(300).unwrap();

impl Default for SlotsStats {
    fn default() -> Self {
        Self {
            stats: Mutex::new(LruCache::new(SLOTS_STATS_CACHE_CAPACITY)),
        }
    }
}

impl SlotsStats {
    pub(crate) fn record_shred(
        &self,
        slot: Slot,
        fec_set_index: u32,
        source: ShredSource,
        slot_meta: Option<&SlotMeta>,
    ) {
        let mut stats = self.stats.lock().unwrap();
        if !stats.contains(&slot) {
            // Report slots evicted while still incomplete; they will not
            // be heard from again.
            if stats.len() == stats.cap().get() {
                if let Some((evicted_slot, evicted_stats)) = stats.pop_lru() {
                    if !evicted_stats.flags.contains(SlotFlags::FULL) {
                        evicted_stats.report(evicted_slot, "evicted");
                    }
                }
            }
            stats.put(slot, SlotStats::default());
        }
        let Some(slot_stats) = stats.get_mut(&slot) else {
            return;
        };
        match source {
            ShredSource::Recovered => slot_stats.num_recovered += 1,
            ShredSource::Repaired => slot_stats.num_repaired += 1,
            ShredSource::Turbine => {
                *slot_stats
                    .turbine_fec_set_index_counts
                    .entry(fec_set_index)
                    .or_default() += 1
            }
        }
        if let Some(meta) = slot_meta {
            if meta.is_full() {
                slot_stats.last_index = meta.last_index.unwrap_or_default();
                if !slot_stats.flags.contains(SlotFlags::FULL) {
                    slot_stats.flags |= SlotFlags::FULL;
                    slot_stats.report(slot, "slot_full");
                }
            }
        }
    }

    fn set_flag(&self, slot: Slot, flag: SlotFlags) {
        if let Some(slot_stats) = self.stats.lock().unwrap().get_mut(&slot) {
            slot_stats.flags |= flag;
        }
    }

    pub(crate) fn mark_dead(&self, slot: Slot) {
        self.set_flag(slot, SlotFlags::DEAD);
    }

    pub(crate) fn mark_rooted(&self, slot: Slot) {
        self.set_flag(slot, SlotFlags::ROOTED);
    }
}
