//! The boundary between the scheduler and the machine-level context
//! switch.
//!
//! The dispatcher never touches register state directly; it drives a
//! [`ContextHandle`] attached to each task. On real hardware the handle
//! wraps the architecture's saved-register area and switch routine; in
//! tests it wraps a host thread's park/unpark token. Either way the
//! contract is the same:
//!
//! * [`ContextHandle::resume`] makes the context eligible to execute on
//!   the given CPU. It must be callable from any context, including one
//!   that is about to suspend itself, and a resume delivered while the
//!   target is not suspended must not be lost (it satisfies the next
//!   suspend instead).
//! * [`ContextHandle::suspend_once`] parks the *calling* context until a
//!   resume is delivered. Spurious returns are permitted, so callers
//!   must re-check their wake condition in a loop.

#![no_std]

use cpu::CpuId;

pub trait ContextHandle: Send + Sync {
    /// Makes this context eligible to run on `cpu`.
    fn resume(&self, cpu: CpuId);

    /// Parks the calling context until the next resume. May return
    /// spuriously.
    fn suspend_once(&self);
}
