use crate::HookError;
use crate::platform::comm::MemoryBasicInfo;
use std::ffi::c_void;
use std::ops::Range;
use std::ptr;
use windows_sys::Win32::Foundation::{ERROR_DYNAMIC_CODE_BLOCKED, GetLastError};
use windows_sys::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, IMAGE_DIRECTORY_ENTRY_IAT,
};
#[cfg(target_pointer_width = "32")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS32 as IMAGE_NT_HEADERS;
#[cfg(target_pointer_width = "64")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS64 as IMAGE_NT_HEADERS;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, VirtualAlloc, VirtualProtect, VirtualQuery,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::SystemServices::{
    IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

pub type PageProtectionFlag = u32;

pub const PAGE_FLAG_EXECUTE_READWRITE: PageProtectionFlag = PAGE_EXECUTE_READWRITE;
pub const PAGE_FLAG_EXECUTE_READ: PageProtectionFlag = PAGE_EXECUTE_READ;

fn last_error() -> HookError {
    HookError::ErrorCode(unsafe { GetLastError() as usize })
}

pub fn vquery(addr: *const c_void) -> Option<MemoryBasicInfo> {
    let mut mbi = unsafe { std::mem::zeroed::<MEMORY_BASIC_INFORMATION>() };
    if (unsafe {
        VirtualQuery(
            addr,
            &mut mbi as *mut _,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    }) == 0
    {
        return None;
    }

    Some(MemoryBasicInfo {
        base_address: mbi.BaseAddress,
        allocation_base: mbi.AllocationBase,
        region_size: mbi.RegionSize,
        is_free: mbi.State == MEM_FREE,
    })
}

pub fn page_size() -> usize {
    let mut info = unsafe { std::mem::zeroed::<SYSTEM_INFO>() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

pub fn vprotect<T>(
    addr: *const T,
    size: usize,
    flag: PageProtectionFlag,
) -> Result<PageProtectionFlag, HookError> {
    let mut out_flag = 0;
    if (unsafe { VirtualProtect(addr.cast(), size, flag, &mut out_flag) }) == 0 {
        Err(last_error())
    } else {
        Ok(out_flag)
    }
}

/// Reserves and commits `size` bytes of RWX memory exactly at `addr`.
pub fn valloc(addr: *const c_void, size: usize) -> Option<*mut c_void> {
    let ptr = unsafe {
        VirtualAlloc(
            addr,
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        if (unsafe { GetLastError() }) == ERROR_DYNAMIC_CODE_BLOCKED {
            log::warn!("dynamic code is blocked in this process");
        }
        return None;
    }
    Some(ptr)
}

pub fn flush_instruction_cache(addr: *const c_void, size: usize) -> Result<(), HookError> {
    if (unsafe { FlushInstructionCache(GetCurrentProcess(), addr, size) }) != 0 {
        Ok(())
    } else {
        Err(last_error())
    }
}

#[inline]
unsafe fn get_iat_range(nt_headers_addr: *const c_void) -> Option<Range<usize>> {
    let header = unsafe { ptr::read_unaligned::<IMAGE_NT_HEADERS>(nt_headers_addr.cast()) };
    if header.Signature != IMAGE_NT_SIGNATURE {
        return None;
    }

    let iat = header
        .OptionalHeader
        .DataDirectory
        .get(IMAGE_DIRECTORY_ENTRY_IAT as usize)?;

    Some(iat.VirtualAddress as usize..iat.VirtualAddress as usize + iat.Size as usize)
}

/// True when `slot` lies inside the import address table of the image that
/// contains `code`.
pub fn is_imported(code: usize, slot: usize) -> bool {
    let Some(mbi) = vquery(code as *const c_void) else {
        return false;
    };
    if mbi.allocation_base.is_null() {
        return false;
    }
    let header = unsafe { ptr::read_unaligned::<IMAGE_DOS_HEADER>(mbi.allocation_base.cast()) };
    if header.e_magic != IMAGE_DOS_SIGNATURE {
        return false;
    }
    let nt_headers = mbi.allocation_base.wrapping_byte_add(header.e_lfanew as usize);
    let Some(range) = (unsafe { get_iat_range(nt_headers) }) else {
        return false;
    };
    range.contains(&slot.wrapping_sub(mbi.allocation_base as usize))
}
