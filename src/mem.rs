use crate::HookError;
use crate::platform::{
    BREAKPOINT, PAGE_FLAG_EXECUTE_READ, PAGE_FLAG_EXECUTE_READWRITE, flush_instruction_cache,
    valloc, vprotect, vquery,
};
use crate::trampoline::Trampoline;
use log::{debug, warn};
use std::ffi::c_void;
use std::ops::{Range, RangeInclusive};
use std::ptr::{self, NonNull};

pub(crate) const DETOUR_REGION_SIZE: usize = 0x10000;

const DETOUR_REGION_SIGNATURE: u32 = u32::from_le_bytes(*b"Rrtd");

const SYSTEM_REGION_BOUND: RangeInclusive<usize> = 0x70000000..=0x80000000;

const SLOT_SIZE: usize = size_of::<Trampoline>();

/// Trampoline slots in a region, the header slot included.
pub(crate) const SLOTS_PER_REGION: usize = DETOUR_REGION_SIZE / SLOT_SIZE;

/// Lives in the first slot of every region.
#[repr(C)]
struct RegionHeader {
    signature: u32,
    free: *mut Trampoline,
    next: *mut RegionHeader,
}

const _: () = assert!(size_of::<RegionHeader>() <= SLOT_SIZE);

fn detour_alloc_round_down_to_region(pb_try: usize) -> usize {
    pb_try & !(DETOUR_REGION_SIZE - 1)
}

fn detour_alloc_round_up_to_region(pb_try: usize) -> Option<usize> {
    let extra = pb_try & (DETOUR_REGION_SIZE - 1);
    if extra != 0 {
        pb_try.checked_add(DETOUR_REGION_SIZE - extra)
    } else {
        Some(pb_try)
    }
}

fn try_alloc_region(pb_try: usize) -> Option<usize> {
    let pv = valloc(pb_try as *const c_void, DETOUR_REGION_SIZE)?;
    debug!("allocated trampoline region at {:#x}", pv as usize);
    Some(pv as usize)
}

/// Searches downward from the top of `range`.
fn detour_alloc_region_from_hi(range: Range<usize>) -> Option<usize> {
    let mut pb_try = detour_alloc_round_down_to_region(range.end.checked_sub(DETOUR_REGION_SIZE)?);
    while pb_try >= range.start && pb_try > 0 {
        if SYSTEM_REGION_BOUND.contains(&pb_try) {
            pb_try = SYSTEM_REGION_BOUND.start().checked_sub(DETOUR_REGION_SIZE)?;
            continue;
        }

        let mbi = vquery(pb_try as *const c_void)?;

        if mbi.is_free {
            if let Some(pv) = try_alloc_region(pb_try) {
                return Some(pv);
            }
            pb_try = pb_try.checked_sub(DETOUR_REGION_SIZE)?;
        } else {
            pb_try = detour_alloc_round_down_to_region(
                (mbi.allocation_base as usize).checked_sub(DETOUR_REGION_SIZE)?,
            );
        }
    }
    None
}

/// Searches upward from the bottom of `range`.
fn detour_alloc_region_from_lo(range: Range<usize>) -> Option<usize> {
    let mut pb_try = detour_alloc_round_up_to_region(range.start)?;
    while pb_try.checked_add(DETOUR_REGION_SIZE)? <= range.end {
        if SYSTEM_REGION_BOUND.contains(&pb_try) {
            pb_try = detour_alloc_round_up_to_region(SYSTEM_REGION_BOUND.end() + 1)?;
            continue;
        }

        let mbi = vquery(pb_try as *const c_void)?;

        if mbi.is_free {
            if let Some(pv) = try_alloc_region(pb_try) {
                return Some(pv);
            }
            pb_try = pb_try.checked_add(DETOUR_REGION_SIZE)?;
        } else {
            pb_try = detour_alloc_round_up_to_region(
                (mbi.base_address as usize).checked_add(mbi.region_size)?,
            )?;
        }
    }
    None
}

/// Tries everything below the target first, then everything above.
fn detour_alloc_trampoline_allocate_new(
    target: usize,
    bounds: &RangeInclusive<usize>,
) -> Option<usize> {
    let start = *bounds.start();
    let end = bounds.end().saturating_add(1);
    detour_alloc_region_from_hi(start..target.clamp(start, end))
        .or_else(|| detour_alloc_region_from_lo(target.clamp(start, end)..end))
}

fn region_in_bounds(region: *mut RegionHeader, bounds: &RangeInclusive<usize>) -> bool {
    let start = region as usize;
    bounds.contains(&start) && bounds.contains(&(start + DETOUR_REGION_SIZE - 1))
}

/// Pool of executable 64 KiB regions carved into trampoline slots.
///
/// Free slots are chained through their own first bytes, so a region needs no
/// bookkeeping beyond its header. Regions are never unmapped: installed hooks
/// keep jumping into them for the life of the process.
pub struct TrampolineArena {
    head: *mut RegionHeader,
    default: *mut RegionHeader,
    count: usize,
}

unsafe impl Send for TrampolineArena {}

impl Default for TrampolineArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TrampolineArena {
    pub fn new() -> TrampolineArena {
        TrampolineArena {
            head: ptr::null_mut(),
            default: ptr::null_mut(),
            count: 0,
        }
    }

    fn regions(&self) -> impl Iterator<Item = *mut RegionHeader> + '_ {
        let mut region = self.head;
        std::iter::from_fn(move || {
            if region.is_null() {
                return None;
            }
            let current = region;
            region = unsafe { (*current).next };
            Some(current)
        })
    }

    pub fn region_count(&self) -> usize {
        self.count
    }

    /// Free slots over all regions.
    pub fn free_count(&self) -> usize {
        self.regions()
            .map(|region| {
                let mut n = 0;
                let mut slot = unsafe { (*region).free };
                while !slot.is_null() {
                    n += 1;
                    slot = unsafe { ptr::read(slot.cast::<*mut Trampoline>()) };
                }
                n
            })
            .sum()
    }

    /// Marks every region writable. Required before allocating or releasing.
    ///
    /// On failure the regions already unlocked are made read/execute again.
    pub fn unlock(&self) -> Result<(), HookError> {
        for (done, region) in self.regions().enumerate() {
            if let Err(e) = vprotect(region, DETOUR_REGION_SIZE, PAGE_FLAG_EXECUTE_READWRITE) {
                for region in self.regions().take(done) {
                    if let Err(e) = vprotect(region, DETOUR_REGION_SIZE, PAGE_FLAG_EXECUTE_READ) {
                        warn!("failed to relock region {:p}: {e}", region);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Marks every region read/execute and flushes it from the instruction
    /// cache.
    pub fn lock(&self) -> Result<(), HookError> {
        for region in self.regions() {
            vprotect(region, DETOUR_REGION_SIZE, PAGE_FLAG_EXECUTE_READ)?;
            flush_instruction_cache(region as *const c_void, DETOUR_REGION_SIZE)?;
        }
        Ok(())
    }

    /// Hands out a slot within `bounds`, mapping a new region near `target`
    /// when no existing one qualifies.
    pub fn allocate_near(
        &mut self,
        target: usize,
        bounds: &RangeInclusive<usize>,
    ) -> Result<NonNull<Trampoline>, HookError> {
        if !self.default.is_null() && region_in_bounds(self.default, bounds) {
            if let Some(slot) = unsafe { Self::pop(self.default) } {
                return Ok(slot);
            }
        }

        let found = self.regions().find(|&region| {
            region_in_bounds(region, bounds) && !unsafe { (*region).free }.is_null()
        });
        if let Some(region) = found {
            self.default = region;
            if let Some(slot) = unsafe { Self::pop(region) } {
                return Ok(slot);
            }
        }

        let base = detour_alloc_trampoline_allocate_new(target, bounds)
            .ok_or(HookError::NotEnoughMemory(target))?;
        let region = unsafe { self.init_region(base) };
        unsafe { Self::pop(region) }.ok_or(HookError::NotEnoughMemory(target))
    }

    /// Writes the header into a fresh region and chains every other slot onto
    /// its free list, lowest address first.
    unsafe fn init_region(&mut self, base: usize) -> *mut RegionHeader {
        let region = base as *mut RegionHeader;
        let mut free: *mut Trampoline = ptr::null_mut();
        for index in (1..SLOTS_PER_REGION).rev() {
            let slot = (base + index * SLOT_SIZE) as *mut Trampoline;
            unsafe { ptr::write(slot.cast::<*mut Trampoline>(), free) };
            free = slot;
        }
        unsafe {
            ptr::write(
                region,
                RegionHeader {
                    signature: DETOUR_REGION_SIGNATURE,
                    free,
                    next: self.head,
                },
            );
        }
        self.head = region;
        self.default = region;
        self.count += 1;
        region
    }

    unsafe fn pop(region: *mut RegionHeader) -> Option<NonNull<Trampoline>> {
        let slot = NonNull::new(unsafe { (*region).free })?;
        unsafe {
            (*region).free = ptr::read(slot.as_ptr().cast::<*mut Trampoline>());
            ptr::write_bytes(slot.as_ptr().cast::<u8>(), 0, SLOT_SIZE);
        }
        Some(slot)
    }

    fn region_of(&self, addr: usize) -> Option<*mut RegionHeader> {
        self.regions().find(|&region| {
            let start = region as usize;
            (start..start + DETOUR_REGION_SIZE).contains(&addr)
        })
    }

    /// Puts a slot back on its region's free list.
    pub fn release(&mut self, trampoline: NonNull<Trampoline>) -> Result<(), HookError> {
        let addr = trampoline.as_ptr() as usize;
        let region = self.region_of(addr).ok_or(HookError::InvalidAddress(addr))?;
        let offset = addr - region as usize;
        if offset == 0 || offset % SLOT_SIZE != 0 {
            return Err(HookError::InvalidAddress(addr));
        }
        let signature = unsafe { (*region).signature };
        if signature != DETOUR_REGION_SIGNATURE {
            return Err(HookError::InvalidSignature(signature, DETOUR_REGION_SIGNATURE));
        }
        unsafe {
            ptr::write_bytes(trampoline.as_ptr().cast::<u8>(), BREAKPOINT, SLOT_SIZE);
            ptr::write(trampoline.as_ptr().cast::<*mut Trampoline>(), (*region).free);
            (*region).free = trampoline.as_ptr();
        }
        self.default = region;
        Ok(())
    }
}
