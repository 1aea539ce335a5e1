//! PCC, Peripheral Clock Controller.
//!
//! One gate-and-source-select register per peripheral slot. Only the slots
//! the bootloader touches are named here.

use volatile_register::RW;

const PCC_BASE: usize = 0x4006_5000;

#[repr(C)]
struct RegisterBlock {
    /// PCCn, one control word per peripheral slot.
    pccn: [RW<u32>; 128],
}

/// CGC, clock gate control.
const PCC_CGC: u32 = 1 << 30;
/// PCS, peripheral clock source select (functional clock).
const PCC_PCS_SHIFT: u32 = 24;
const PCC_PCS_MASK: u32 = 0b111 << PCC_PCS_SHIFT;

/// Peripheral slots, by PCCn index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Clock {
    Ftfc = 32,
    PortA = 73,
    PortB = 74,
    PortC = 75,
    PortD = 76,
    PortE = 77,
    Lpuart0 = 106,
    Lpuart1 = 107,
    Lpuart2 = 108,
}

/// Functional clock sources for the PCS field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    /// SOSCDIV2_CLK, 8 MHz with the board's system oscillator setup.
    SoscDiv2 = 1,
    SircDiv2 = 2,
    FircDiv2 = 3,
    SpllDiv2 = 6,
}

fn regs() -> &'static RegisterBlock {
    unsafe { &*(PCC_BASE as *const RegisterBlock) }
}

/// Open the clock gate for `clock`.
pub fn enable(clock: Clock) {
    unsafe { regs().pccn[clock as usize].modify(|v| v | PCC_CGC) }
}

/// Close the clock gate for `clock`.
pub fn disable(clock: Clock) {
    unsafe { regs().pccn[clock as usize].modify(|v| v & !PCC_CGC) }
}

/// Select a functional clock source and open the gate.
///
/// PCS may only be written while the gate is closed, so the gate is cycled.
pub fn enable_with_source(clock: Clock, source: ClockSource) {
    let pccn = &regs().pccn[clock as usize];
    unsafe {
        pccn.modify(|v| v & !PCC_CGC);
        pccn.modify(|v| (v & !PCC_PCS_MASK) | ((source as u32) << PCC_PCS_SHIFT) | PCC_CGC);
    }
}
