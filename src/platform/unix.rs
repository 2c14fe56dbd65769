use crate::HookError;
use crate::platform::comm::MemoryBasicInfo;
use region::Protection;
use std::ffi::c_void;
use std::ptr;

pub type PageProtectionFlag = Protection;

pub const PAGE_FLAG_EXECUTE_READWRITE: PageProtectionFlag = Protection::READ_WRITE_EXECUTE;
pub const PAGE_FLAG_EXECUTE_READ: PageProtectionFlag = Protection::READ_EXECUTE;

/// Unmapped addresses are reported one page at a time; the mapping call
/// decides whether a whole region fits.
pub fn vquery(addr: *const c_void) -> Option<MemoryBasicInfo> {
    match region::query(addr) {
        Ok(region) => {
            let range = region.as_range();
            Some(MemoryBasicInfo {
                base_address: range.start as *const c_void,
                allocation_base: range.start as *const c_void,
                region_size: range.end - range.start,
                is_free: false,
            })
        }
        Err(region::Error::UnmappedRegion) => {
            let page = region::page::floor(addr);
            Some(MemoryBasicInfo {
                base_address: page,
                allocation_base: page,
                region_size: region::page::size(),
                is_free: true,
            })
        }
        Err(_) => None,
    }
}

pub fn page_size() -> usize {
    region::page::size()
}

pub fn vprotect<T>(
    addr: *const T,
    size: usize,
    flag: PageProtectionFlag,
) -> Result<PageProtectionFlag, HookError> {
    let old_flag = region::query(addr)?.protection();
    unsafe { region::protect(addr, size, flag)? };
    Ok(old_flag)
}

/// Maps `size` bytes of RWX memory exactly at `addr`. The address is only a
/// hint to the kernel, so a mapping placed elsewhere is discarded.
pub fn valloc(addr: *const c_void, size: usize) -> Option<*mut c_void> {
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    if ptr as *const c_void != addr {
        unsafe { libc::munmap(ptr, size) };
        return None;
    }
    Some(ptr)
}

/// x86 keeps instruction fetch coherent with data writes.
pub fn flush_instruction_cache(_addr: *const c_void, _size: usize) -> Result<(), HookError> {
    Ok(())
}

/// True when `slot` looks like a linker-filled import slot: readable data that
/// holds the address of executable code.
pub fn is_imported(_code: usize, slot: usize) -> bool {
    let Ok(slot_region) = region::query(slot as *const u8) else {
        return false;
    };
    let protection = slot_region.protection();
    if !protection.contains(Protection::READ) || protection.contains(Protection::EXECUTE) {
        return false;
    }
    if slot_region.as_range().end - slot < size_of::<usize>() {
        return false;
    }
    let value = unsafe { ptr::read_unaligned(slot as *const usize) };
    region::query(value as *const u8)
        .map(|r| r.protection().contains(Protection::EXECUTE))
        .unwrap_or(false)
}
