use crate::HookError;
use crate::platform::{PAGE_FLAG_EXECUTE_READWRITE, PageProtectionFlag, page_size, vprotect};
use std::ffi::c_void;
use std::ptr;

pub struct MemoryBasicInfo {
    pub base_address: *const c_void,
    pub allocation_base: *const c_void,
    pub region_size: usize,
    pub is_free: bool,
}

/// Keeps `size` bytes at `addr` writable and executable until dropped, then
/// puts back the protection each page had at construction.
pub struct MemoryProtector {
    addr: usize,
    size: usize,
    pages: Vec<(usize, PageProtectionFlag)>,
}

impl MemoryProtector {
    pub fn new(addr: usize, size: usize) -> Result<MemoryProtector, HookError> {
        let page_size = page_size();
        let end = addr.checked_add(size).ok_or(HookError::InvalidAddress(addr))?;
        let mut protector = MemoryProtector {
            addr,
            size,
            pages: Vec::new(),
        };
        // pages raised so far are restored by drop if a later one fails
        let mut page = addr & !(page_size - 1);
        while page < end {
            let old_flag =
                vprotect(page as *const c_void, page_size, PAGE_FLAG_EXECUTE_READWRITE)?;
            protector.pages.push((page, old_flag));
            page += page_size;
        }
        Ok(protector)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Overwrites the start of the protected range with `bytes`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), HookError> {
        if bytes.len() > self.size {
            return Err(HookError::BufferOverflow);
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr as *mut u8, bytes.len());
        }
        Ok(())
    }
}

impl Drop for MemoryProtector {
    fn drop(&mut self) {
        let page_size = page_size();
        for &(page, old_flag) in self.pages.iter().rev() {
            if let Err(e) = vprotect(page as *const c_void, page_size, old_flag) {
                log::warn!("failed to restore protection at {page:#x}: {e}");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use region::Protection;

    #[test]
    fn protection_is_restored_on_drop() {
        let alloc = region::alloc(0x1000, Protection::READ_EXECUTE).unwrap();
        let addr = alloc.as_ptr::<u8>() as usize;

        let mut protector = MemoryProtector::new(addr, 5).unwrap();
        protector.write(&[0xcc; 5]).unwrap();
        assert!(matches!(
            protector.write(&[0x90; 6]),
            Err(HookError::BufferOverflow)
        ));
        drop(protector);

        let region = region::query(addr as *const u8).unwrap();
        assert_eq!(region.protection(), Protection::READ_EXECUTE);
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 6) };
        assert_eq!(bytes, &[0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]);
    }

    #[test]
    fn each_page_gets_its_own_protection_back() {
        let page = region::page::size();
        let alloc = region::alloc(2 * page, Protection::READ_EXECUTE).unwrap();
        let base = alloc.as_ptr::<u8>() as usize;
        unsafe {
            region::protect((base + page) as *const u8, page, Protection::READ_WRITE).unwrap();
        }

        // five bytes straddling the page boundary
        let addr = base + page - 3;
        let mut protector = MemoryProtector::new(addr, 5).unwrap();
        protector.write(&[0x90; 5]).unwrap();
        drop(protector);

        let first = region::query(base as *const u8).unwrap().protection();
        let second = region::query((base + page) as *const u8).unwrap().protection();
        assert_eq!(first, Protection::READ_EXECUTE);
        assert_eq!(second, Protection::READ_WRITE);
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 5) };
        assert_eq!(bytes, &[0x90; 5]);
    }
}
