use tracing::debug;

use super::heap::{Entity, EntityRef, Heap};

/// Fraction of detected physical RAM used as the collection threshold.
pub const GC_PERCENT: f64 = 0.01;

/// Fallback when the OS probe fails.
const FALLBACK_RAM_BYTES: usize = 8 * 1024 * 1024 * 1024;

/// Mark-and-sweep collector with byte-budget triggering.
///
/// The collector owns the allocation accounting; the heap itself lives in
/// the machine. A cycle is due when the bytes allocated since the last sweep
/// exceed the threshold — tracking the delta rather than the absolute count
/// prevents thrashing when the live set approaches the budget.
#[derive(Debug)]
pub struct GarbageCollector {
    bytes_allocated: usize,
    threshold: usize,
    after_last_clean: usize,
    marks: Vec<bool>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        let total_ram = detect_total_ram_bytes();
        Self::with_threshold((total_ram as f64 * GC_PERCENT) as usize)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            bytes_allocated: 0,
            threshold: threshold.max(1),
            after_last_clean: 0,
            marks: Vec::new(),
        }
    }

    pub fn set_total_available_ram(&mut self, bytes: usize) {
        self.threshold = ((bytes as f64 * GC_PERCENT) as usize).max(1);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn add_allocated_bytes(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated.saturating_sub(self.after_last_clean) > self.threshold
    }

    /// True when even a completed collection left the budget exceeded; the
    /// triggering allocation must then fail with out-of-memory.
    pub fn over_budget(&self) -> bool {
        self.bytes_allocated > self.threshold
    }

    /// Runs one full stop-the-world cycle. `roots` must enumerate every
    /// reference on the operand stack and in every active frame's locals.
    pub fn collect<I>(&mut self, heap: &mut Heap, roots: I)
    where
        I: IntoIterator<Item = EntityRef>,
    {
        self.mark(heap, roots);
        let freed = self.sweep(heap);
        debug!(
            freed_bytes = freed,
            bytes_allocated = self.bytes_allocated,
            population = heap.population(),
            "gc cycle"
        );
    }

    fn mark<I>(&mut self, heap: &Heap, roots: I)
    where
        I: IntoIterator<Item = EntityRef>,
    {
        self.marks.clear();
        self.marks.resize(heap.slot_count(), false);

        // The worklist replaces recursion; the mark bitmap doubles as the
        // seen set, so cyclic arrays terminate.
        let mut worklist: Vec<EntityRef> = roots.into_iter().collect();
        while let Some(reference) = worklist.pop() {
            // Only references that resolve into this heap are followed;
            // stale handles are dangling and contribute nothing.
            let Some(entity) = heap.get(reference) else {
                continue;
            };
            let slot = reference.slot();
            if self.marks[slot] {
                continue;
            }
            self.marks[slot] = true;
            if let Entity::Array(items) = entity {
                worklist.extend(items.iter().copied());
            }
        }
    }

    fn sweep(&mut self, heap: &mut Heap) -> usize {
        let dead: Vec<usize> = heap
            .live_slots()
            .filter(|(index, _)| !self.marks.get(*index).copied().unwrap_or(false))
            .map(|(index, _)| index)
            .collect();

        let mut freed_bytes = 0;
        for index in dead {
            if let Some(entity) = heap.free_slot(index) {
                freed_bytes += entity.heap_size();
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.after_last_clean = self.bytes_allocated;
        freed_bytes
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical RAM via POSIX sysconf, with a fixed fallback.
fn detect_total_ram_bytes() -> usize {
    #[cfg(unix)]
    {
        let pages = sysconf_value(libc::_SC_PHYS_PAGES);
        let page_size = sysconf_value(libc::_SC_PAGE_SIZE);
        if let (Some(pages), Some(page_size)) = (pages, page_size) {
            return pages.saturating_mul(page_size);
        }
    }
    FALLBACK_RAM_BYTES
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn sysconf_value(name: libc::c_int) -> Option<usize> {
    // SAFETY: sysconf takes no pointers and only reads system configuration.
    let value = unsafe { libc::sysconf(name) };
    usize::try_from(value).ok().filter(|&v| v > 0)
}
