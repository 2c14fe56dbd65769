use iced_x86::IcedError;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("target function pointer is null")]
    NullTarget,
    #[error("detour function pointer is null")]
    NullDetour,
    #[error("detour {0:#x} is the target itself")]
    SelfDetour(usize),
    #[error("target {0:#x} is already detoured")]
    AlreadyAttached(usize),
    #[error("function type must be pointer sized")]
    InvalidPointer,
    #[error("invalid address {0:#x}")]
    InvalidAddress(usize),
    #[error("invalid signature {0:#x} != {1:#x}")]
    InvalidSignature(u32, u32),
    #[error("no trampoline region within reach of {0:#x}")]
    NotEnoughMemory(usize),
    #[error("prologue at {target:#x} has only {size} relocatable bytes")]
    UndersizedPrologue { target: usize, size: usize },
    #[error("prologue at {0:#x} does not fit in a trampoline")]
    OversizedPrologue(usize),
    #[error("cannot decode instruction at {0:#x}")]
    InvalidInstruction(usize),
    #[error("cannot relocate instruction at {ip:#x}: {source}")]
    Relocation {
        ip: usize,
        #[source]
        source: IcedError,
    },
    #[error("jump from {from:#x} to {to:#x} is out of range")]
    JumpOutOfRange { from: usize, to: usize },
    #[error("code buffer overflow")]
    BufferOverflow,
    #[error("a transaction is already open")]
    TransactionInProgress,
    #[error("lock poison")]
    LockPoison,
    #[error("error code: {0}")]
    ErrorCode(usize),
    #[cfg(not(windows))]
    #[error("memory error: {0}")]
    Region(#[from] region::Error),
}
