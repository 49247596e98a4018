//! Thin wrappers around the VMX and port I/O instructions the core relies
//! on. Under `cfg(test)` the VMCS accessors are backed by an in-memory field
//! store so the exit handlers can be driven on a host without VMX enabled.

#![allow(dead_code)]

/// Read a specified field from the current VMCS.
#[cfg(not(test))]
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Write to a specified field in the current VMCS.
#[cfg(not(test))]
pub fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// Reads 8-bits from an IO port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub fn outb(port: u16, val: u8) {
    unsafe { x86::io::outb(port, val) };
}


#[cfg(test)]
pub fn vmread(field: u32) -> u64 {
    *fake_vmcs::FIELDS.lock().get(&field).unwrap_or(&0)
}

#[cfg(test)]
pub fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    fake_vmcs::FIELDS.lock().insert(field, u64::from(val));
}

/// Clears every field of the fake VMCS between tests.
#[cfg(test)]
pub fn vmcs_reset() {
    fake_vmcs::FIELDS.lock().clear();
}
