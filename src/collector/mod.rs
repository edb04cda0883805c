//! Stop-the-world mark and sweep-compact collection.
//!
//! A cycle marks from every root source, clears weak array entries whose
//! referents stayed unmarked, runs callback objects' post-mark hooks, plans a
//! destination for every live block, rewrites references to those
//! destinations and finally slides the blocks. Locked blocks never move.

pub(crate) mod compact;
pub(crate) mod mark;

use std::time::Instant;

use crate::collector_phase::CollectorPhase;
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::stats::CollectionStats;

impl Heap {
    /// Runs a full collection.
    ///
    /// References held outside roots, handles and callback objects are stale
    /// afterwards if anything moved, died or was freed since the last
    /// collection; the returned epoch says which
    /// references are current.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let _garbage = heap.allocate_array(Value::Nil, 10).unwrap();
    /// let kept = heap.allocate_array(Value::Int(1), 2).unwrap();
    /// let root = heap.add_root(kept).unwrap();
    ///
    /// let stats = heap.collect().unwrap();
    /// assert_eq!(stats.live_objects, 1);
    /// assert_eq!(stats.reclaimed_slots, 12);
    ///
    /// let kept = heap.root(root).unwrap();
    /// assert_eq!(heap.class_of(kept).unwrap(), Value::Int(1));
    /// ```
    pub fn collect(&mut self) -> HeapResult<CollectionStats> {
        self.check_poisoned()?;
        if self.config.verify_heap {
            self.verify()?;
        }
        self.collector.begin()?;

        let started = Instant::now();
        let stats = match self.run_collection() {
            Ok(stats) => stats,
            Err(e) => {
                self.collector.abort();
                // Marks, stubs and references may be half rewritten.
                let reason = match &e {
                    HeapError::HeapCorruption(reason) => reason.clone(),
                    other => format!("collection aborted: {other}"),
                };
                self.poison(&reason);
                return Err(e);
            }
        };
        let stats = CollectionStats {
            duration: started.elapsed(),
            ..stats
        };
        self.collections += 1;
        tracing::debug!(
            collection = self.collections,
            epoch = stats.epoch,
            live_objects = stats.live_objects,
            reclaimed_slots = stats.reclaimed_slots,
            moved_objects = stats.moved_objects,
            weak_slots_cleared = stats.weak_slots_cleared,
            duration_us = stats.duration.as_micros() as u64,
            "collection finished"
        );
        self.last_collection = Some(stats.clone());

        if self.config.verify_heap {
            self.verify()?;
        }
        Ok(stats)
    }

    fn run_collection(&mut self) -> HeapResult<CollectionStats> {
        let summary = mark::mark(self)?;
        let weak_slots_cleared = self.weak_chain.clear_dead_entries(&mut self.arena)?;
        mark::after_mark(self);

        self.collector.advance(CollectorPhase::Planning)?;
        let mut plan = compact::plan(self)?;
        let epoch = if plan.changes_layout() || self.arena.has_freed() {
            self.epoch.wrapping_add(1)
        } else {
            self.epoch
        };

        self.collector.advance(CollectorPhase::Rewriting)?;
        let declawed_refs = compact::rewrite(self, &mut plan, epoch)?;

        self.collector.advance(CollectorPhase::Moving)?;
        let indirect_deleted = compact::relocate(self, &plan)?;
        if epoch != self.epoch {
            self.arena.start_epoch(epoch);
            self.epoch = epoch;
        }
        self.collector.advance(CollectorPhase::Idle)?;

        Ok(CollectionStats {
            epoch,
            live_objects: summary.live_objects,
            live_slots: summary.live_slots,
            reclaimed_slots: plan.reclaimed_slots,
            moved_objects: plan.moved_objects,
            weak_slots_cleared,
            declawed_refs,
            indirect_deleted,
            ..CollectionStats::default()
        })
    }

    pub fn collector_phase(&self) -> CollectorPhase {
        self.collector.phase()
    }
}
