//! Core of a thin Intel VT-x hypervisor extension that performs TLB-split
//! code hooking: a hooked 4-KiB guest page is backed by two frames, one
//! served on instruction fetches and one served on data reads and writes,
//! swapped transparently by rewriting EPT leaf entries from the EPT
//! violation handler. A privileged guest agent drives the mechanism over a
//! register-based vmcall interface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod allocate;
pub mod error;
pub mod global;
pub mod global_const;
pub mod intel;
pub mod logger;

#[cfg(test)]
mod tests;
