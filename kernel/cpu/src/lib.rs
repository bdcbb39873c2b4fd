//! CPU identity and enumeration.
//!
//! The number of CPUs is fixed once at boot via [`init()`]; after that,
//! every `CpuId` handed out by this crate is valid for the lifetime of
//! the system, so per-CPU registries indexed by [`CpuId::index()`] never
//! need existence checks.

#![no_std]

use derive_more::Display;
use spin::Once;

/// Upper bound on the number of CPUs; per-CPU arrays are sized by this.
pub const MAX_CPUS: usize = 64;

/// A unique identifier for a single CPU.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "cpu{}", _0)]
pub struct CpuId(u32);

impl CpuId {
    /// Wraps a raw CPU number. The caller is responsible for it being
    /// in range; out-of-range IDs are caught by [`init`]-time checks in
    /// the registries that consume them.
    pub const fn new(raw: u32) -> CpuId {
        CpuId(raw)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// This CPU's index into per-CPU arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

static CPU_COUNT: Once<usize> = Once::new();

/// Fixes the number of CPUs in the system. Callable exactly once, before
/// any scheduler component is initialized.
pub fn init(count: usize) -> Result<(), &'static str> {
    if count == 0 || count > MAX_CPUS {
        return Err("CPU count out of range");
    }
    let mut first = false;
    CPU_COUNT.call_once(|| {
        first = true;
        count
    });
    if first {
        log::info!("initialized with {} CPUs", count);
        Ok(())
    } else {
        Err("CPU count was already initialized")
    }
}

pub fn is_initialized() -> bool {
    CPU_COUNT.get().is_some()
}

/// The number of CPUs fixed by [`init()`].
///
/// Panics if called before `init()`; every caller of this runs strictly
/// after boot-time initialization.
pub fn cpu_count() -> usize {
    *CPU_COUNT
        .get()
        .unwrap_or_else(|| panic!("BUG: cpu_count() called before cpu::init()"))
}

/// Iterates over all valid CPU IDs, in ascending order.
pub fn cpus() -> impl Iterator<Item = CpuId> {
    (0..cpu_count() as u32).map(CpuId::new)
}

/// The CPU that performs system bring-up.
pub const fn bootstrap_cpu() -> CpuId {
    CpuId(0)
}
