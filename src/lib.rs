//! Pure rust version of the `Detours` hooking engine for x86 and x86-64.
//!
//! A target function's first instructions are moved into a trampoline placed
//! within 2GB of it, and a `jmp` to the detour is written in their place.
//! Hooks are applied in transactions and stay installed for the life of the
//! process.
//!
//! # Example
//!
//! ```no_run
//! use detours_rs::Detours;
//! use std::sync::OnceLock;
//!
//! type Add = extern "C" fn(i32, i32) -> i32;
//!
//! static ORIGINAL: OnceLock<Add> = OnceLock::new();
//!
//! extern "C" fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! extern "C" fn add_hooked(a: i32, b: i32) -> i32 {
//!     ORIGINAL.get().map_or(0, |original| original(a, b) + 1)
//! }
//!
//! let detours = Detours::new();
//! let mut original = add as Add;
//! let mut tx = detours.begin().expect("begin");
//! unsafe { tx.attach(&mut original, add_hooked as Add) }.expect("attach");
//! tx.commit().expect("commit");
//! ORIGINAL.set(original).ok();
//!
//! assert_eq!(add(2, 3), 6);
//! ```

mod detours;
mod disassembly;
mod error;
mod mem;
mod patcher;
pub(crate) mod platform;
mod trampoline;

pub use detours::{Detours, Hook, Transaction, code_from_pointer};
pub use error::HookError;
pub use mem::TrampolineArena;
pub use patcher::{CodeBuffer, CodePatcher, RelocatedInstruction};
pub use platform::X86;
pub use trampoline::Trampoline;
