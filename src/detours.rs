use crate::HookError;
use crate::mem::TrampolineArena;
use crate::patcher::{CodeBuffer, CodePatcher};
use crate::platform::{MemoryProtector, X86, flush_instruction_cache};
use crate::trampoline::{self, TRAMPOLINE_CODE_SIZE, Trampoline};
use fnv::FnvHashMap;
use log::{debug, trace, warn};
use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, TryLockError};

/// Skips the import and incremental linking stubs in front of `ptr`.
///
/// # Safety
///
/// `ptr` must be null or point at readable machine code.
pub unsafe fn code_from_pointer<T>(ptr: *const T) -> *const T {
    if ptr.is_null() {
        return ptr;
    }
    unsafe { X86.skip_forwarding_jump(ptr as usize) as *const T }
}

/// An installed detour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hook {
    target: usize,
    trampoline: usize,
    detour: usize,
    cb_target: usize,
}

impl Hook {
    /// Address whose prologue was replaced.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn trampoline_addr(&self) -> usize {
        self.trampoline
    }

    pub fn detour(&self) -> usize {
        self.detour
    }

    /// Bytes of the target that were moved into the trampoline.
    pub fn cb_target(&self) -> usize {
        self.cb_target
    }

    /// The original function.
    ///
    /// # Safety
    ///
    /// `F` must be the function pointer type of the target.
    pub unsafe fn trampoline<F: Copy>(&self) -> Result<F, HookError> {
        if size_of::<F>() != size_of::<usize>() {
            return Err(HookError::InvalidPointer);
        }
        Ok(unsafe { mem::transmute_copy::<usize, F>(&self.trampoline) })
    }
}

struct Inner {
    arena: TrampolineArena,
    hooks: FnvHashMap<usize, Hook>,
}

/// A hooking session: the trampoline regions it owns and the hooks it has
/// installed.
pub struct Detours<P: CodePatcher = X86> {
    patcher: P,
    inner: Mutex<Inner>,
}

impl Default for Detours<X86> {
    fn default() -> Self {
        Self::new()
    }
}

impl Detours<X86> {
    pub fn new() -> Detours<X86> {
        Self::with_patcher(X86)
    }
}

impl<P: CodePatcher> Detours<P> {
    pub fn with_patcher(patcher: P) -> Detours<P> {
        Detours {
            patcher,
            inner: Mutex::new(Inner {
                arena: TrampolineArena::new(),
                hooks: FnvHashMap::default(),
            }),
        }
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, Inner>, HookError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(HookError::TransactionInProgress),
            Err(TryLockError::Poisoned(_)) => Err(HookError::LockPoison),
        }
    }

    /// Opens the session's only transaction.
    pub fn begin(&self) -> Result<Transaction<'_, P>, HookError> {
        let guard = self.try_lock()?;
        // a failed unlock has already put the regions back to read/execute
        guard.arena.unlock()?;
        debug!("transaction begin");
        Ok(Transaction {
            guard,
            patcher: &self.patcher,
            pending: Vec::new(),
        })
    }

    /// Hook installed on `target`, a resolved code address.
    pub fn get(&self, target: usize) -> Result<Option<Hook>, HookError> {
        Ok(self.try_lock()?.hooks.get(&target).copied())
    }

    pub fn hooks(&self) -> Result<Vec<Hook>, HookError> {
        Ok(self.try_lock()?.hooks.values().copied().collect())
    }

    pub fn region_count(&self) -> Result<usize, HookError> {
        Ok(self.try_lock()?.arena.region_count())
    }

    pub fn free_count(&self) -> Result<usize, HookError> {
        Ok(self.try_lock()?.arena.free_count())
    }
}

/// A detour that is ready to be written over its target.
struct Operation {
    pointer: *mut *const c_void,
    target: usize,
    detour: usize,
    trampoline: NonNull<Trampoline>,
    protector: MemoryProtector,
}

/// Batch of attaches applied together by [`commit`].
///
/// Dropping a transaction without committing it aborts every pending attach.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'a, P: CodePatcher = X86> {
    guard: MutexGuard<'a, Inner>,
    patcher: &'a P,
    pending: Vec<Operation>,
}

impl<'a, P: CodePatcher> Transaction<'a, P> {
    /// Queues a detour for the function `pointer` refers to. On commit the
    /// target runs `detour` and `pointer` is updated to the trampoline.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type, and both `*pointer` and `detour`
    /// must point at code that stays mapped for the life of the process.
    pub unsafe fn attach<F: Copy>(
        &mut self,
        pointer: &'a mut F,
        detour: F,
    ) -> Result<(), HookError> {
        if size_of::<F>() != size_of::<usize>() {
            return Err(HookError::InvalidPointer);
        }
        let detour = unsafe { mem::transmute_copy::<F, *const c_void>(&detour) };
        let pointer = (pointer as *mut F).cast::<*const c_void>();
        unsafe { self.attach_raw(pointer, detour) }
    }

    /// Untyped [`attach`](Transaction::attach).
    ///
    /// # Safety
    ///
    /// `pointer` must be valid for reads and writes until the transaction ends,
    /// and both `*pointer` and `detour` must point at code that stays mapped for
    /// the life of the process.
    pub unsafe fn attach_raw(
        &mut self,
        pointer: *mut *const c_void,
        detour: *const c_void,
    ) -> Result<(), HookError> {
        if pointer.is_null() {
            return Err(HookError::InvalidPointer);
        }
        let target = unsafe { *pointer } as usize;
        if target == 0 {
            return Err(HookError::NullTarget);
        }
        if detour.is_null() {
            return Err(HookError::NullDetour);
        }

        let target = unsafe { self.patcher.skip_forwarding_jump(target) };
        let detour = unsafe { self.patcher.skip_forwarding_jump(detour as usize) };
        if target == detour {
            return Err(HookError::SelfDetour(target));
        }
        if self.guard.hooks.contains_key(&target)
            || self.pending.iter().any(|op| op.target == target)
        {
            return Err(HookError::AlreadyAttached(target));
        }

        let bounds = unsafe { self.patcher.jump_bounds(target) };
        let slot = self.guard.arena.allocate_near(target, &bounds)?;
        trace!("attach {target:#x} -> {detour:#x} using trampoline {:p}", slot);

        if let Err(e) = unsafe { trampoline::build(self.patcher, slot, target, detour) } {
            self.release(slot);
            return Err(e);
        }

        let cb_target = unsafe { slot.as_ref() }.cb_target();
        let protector = match MemoryProtector::new(target, cb_target) {
            Ok(protector) => protector,
            Err(e) => {
                self.release(slot);
                return Err(e);
            }
        };

        self.pending.push(Operation {
            pointer,
            target,
            detour,
            trampoline: slot,
            protector,
        });
        Ok(())
    }

    /// Number of attaches waiting for commit.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn release(&mut self, slot: NonNull<Trampoline>) {
        if let Err(e) = self.guard.arena.release(slot) {
            warn!("failed to release trampoline {:p}: {e}", slot);
        }
    }

    /// Writes every pending detour and returns how many were installed.
    /// Operations are applied newest first.
    pub fn commit(mut self) -> Result<usize, HookError> {
        let mut patches = Vec::with_capacity(self.pending.len());
        for op in self.pending.iter().rev() {
            let trampoline = unsafe { op.trampoline.as_ref() };
            let mut patch = CodeBuffer::<TRAMPOLINE_CODE_SIZE>::new(op.target);
            self.patcher.emit_jump(&mut patch, trampoline.detour_stub())?;
            self.patcher.emit_filler(&mut patch, trampoline.cb_target())?;
            if patch.len() > op.protector.size() {
                return Err(HookError::BufferOverflow);
            }
            patches.push(patch);
        }

        let mut operations = mem::take(&mut self.pending);
        operations.reverse();

        for (op, patch) in operations.iter_mut().zip(&patches) {
            let trampoline = unsafe { op.trampoline.as_ref() };
            trace!(
                "patch {:#x}: {} ({} bytes relocated as {}, resume at {:#x}, detour {:#x})",
                op.target,
                hex::encode(patch.as_slice()),
                trampoline.cb_target(),
                trampoline.cb_code(),
                trampoline.remain(),
                trampoline.detour()
            );
            op.protector.write(patch.as_slice())?;
            unsafe { *op.pointer = trampoline.code() as *const c_void };
        }

        let count = operations.len();
        for op in operations {
            let Operation {
                target,
                detour,
                trampoline,
                protector,
                ..
            } = op;
            let trampoline = unsafe { trampoline.as_ref() };
            let cb_target = trampoline.cb_target();
            drop(protector);
            if let Err(e) = flush_instruction_cache(target as *const c_void, cb_target) {
                warn!("failed to flush {target:#x}: {e}");
            }
            self.guard.hooks.insert(
                target,
                Hook {
                    target,
                    trampoline: trampoline.code(),
                    detour,
                    cb_target,
                },
            );
        }

        debug!("transaction commit: {count} hooks installed");
        Ok(count)
    }
}

impl<P: CodePatcher> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!("transaction abort: {} pending", self.pending.len());
        }
        while let Some(op) = self.pending.pop() {
            self.release(op.trampoline);
        }
        if let Err(e) = self.guard.arena.lock() {
            warn!("failed to lock trampoline regions: {e}");
        }
    }
}
