//! WDOG, watchdog timer.

use volatile_register::RW;

const WDOG_BASE: usize = 0x4005_2000;

#[repr(C)]
struct RegisterBlock {
    cs: RW<u32>,
    cnt: RW<u32>,
    toval: RW<u32>,
}

const WDOG_UNLOCK_KEY: u32 = 0xD928_C520;

/// Unlock and disable the watchdog.
///
/// Must run within 128 bus cycles of the unlock write; call it first thing
/// after reset, before the clock tree is reconfigured. The bootloader path
/// runs without a watchdog: sector erases stall the core for longer than
/// any refresh interval the application would want.
pub fn disable() {
    let wdog = unsafe { &*(WDOG_BASE as *const RegisterBlock) };
    unsafe {
        wdog.cnt.write(WDOG_UNLOCK_KEY);
        wdog.toval.write(0x0000_FFFF);
        wdog.cs.write(0x0000_2100);
    }
}
