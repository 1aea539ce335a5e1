#![no_std]

//! UART S-record bootloader for the NXP S32K144.
//!
//! The crate is the resident half of a two-stage firmware layout: the
//! bootloader occupies the first 40 KiB of program flash and the user
//! application everything above `0xA000`. On entry the bootloader samples a
//! boot pin; with the button released and a valid image resident it hands
//! execution straight to the application, otherwise it erases the
//! application region, ingests a Motorola S-record image over LPUART1 and
//! programs it through an 8-byte phrase cache before jumping.
//!
//! A board crate provides the vector table and forwards the `LPUART1_RxTx`
//! interrupt to [`uart::on_interrupt`]; everything else lives here.

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub(crate) mod testutil;

pub mod boot;
pub mod flash;
pub mod gpio;
pub mod pcc;
pub mod queue;
pub mod srec;
pub mod uart;
pub mod wdog;

pub use self::boot::{Bootloader, MemoryMap};

/// Device interrupt numbers used by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Interrupt {
    /// LPUART1 combined transmit/receive interrupt.
    Lpuart1RxTx = 33,
}

unsafe impl cortex_m::interrupt::InterruptNumber for Interrupt {
    fn number(self) -> u16 {
        self as u16
    }
}
