//! PORT/GPIO digital input pins.
//!
//! Just enough of the PORT mux and GPIO data path for the boot-mode button;
//! the LED and output machinery of the demo firmware has no place in the
//! bootloader image.

use volatile_register::{RO, RW};

use crate::pcc;

/// Represents a digital input or output level.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Logical low.
    Low,
    /// Logical high.
    High,
}

impl From<bool> for Level {
    fn from(val: bool) -> Self {
        match val {
            true => Self::High,
            false => Self::Low,
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        match level {
            Level::Low => false,
            Level::High => true,
        }
    }
}

/// Represents a pull setting for an input.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    /// No pull.
    None,
    /// Internal pull-up resistor.
    Up,
    /// Internal pull-down resistor.
    Down,
}

/// GPIO port bank.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
}

impl Port {
    fn clock(self) -> pcc::Clock {
        match self {
            Port::A => pcc::Clock::PortA,
            Port::B => pcc::Clock::PortB,
            Port::C => pcc::Clock::PortC,
            Port::D => pcc::Clock::PortD,
            Port::E => pcc::Clock::PortE,
        }
    }
}

// PORT pin control register blocks (mux, pulls, filters).
#[repr(C)]
struct PortRegisterBlock {
    pcr: [RW<u32>; 32],
}

// GPIO data register blocks.
#[repr(C)]
struct GpioRegisterBlock {
    // PDOR, PSOR, PCOR, PTOR
    _reserved0: [u32; 4],
    pdir: RO<u32>,
    pddr: RW<u32>,
}

const PORT_BASES: [usize; 5] = [0x4004_9000, 0x4004_A000, 0x4004_B000, 0x4004_C000, 0x4004_D000];
const GPIO_BASES: [usize; 5] = [0x400F_F000, 0x400F_F040, 0x400F_F080, 0x400F_F0C0, 0x400F_F100];

// PCR fields.
const PCR_PS: u32 = 1 << 0;
const PCR_PE: u32 = 1 << 1;
const PCR_MUX_SHIFT: u32 = 8;
const PCR_MUX_MASK: u32 = 0b111 << PCR_MUX_SHIFT;
const PCR_MUX_GPIO: u32 = 1;

fn port_regs(port: Port) -> &'static PortRegisterBlock {
    unsafe { &*(PORT_BASES[port as usize] as *const PortRegisterBlock) }
}

fn gpio_regs(port: Port) -> &'static GpioRegisterBlock {
    unsafe { &*(GPIO_BASES[port as usize] as *const GpioRegisterBlock) }
}

/// Route `port.pin` to one of its alternate functions.
pub(crate) fn set_alt_function(port: Port, pin: u8, alt: u8) {
    pcc::enable(port.clock());
    unsafe {
        port_regs(port).pcr[pin as usize]
            .modify(|v| (v & !PCR_MUX_MASK) | ((alt as u32) << PCR_MUX_SHIFT));
    }
}

/// GPIO input pin driver.
pub struct Input {
    port: Port,
    pin: u8,
}

impl Input {
    /// Configure `port.pin` as a GPIO input with the given pull.
    ///
    /// Opens the port clock gate and takes the pin out of whatever mux
    /// state the previous firmware stage left it in.
    pub fn new(port: Port, pin: u8, pull: Pull) -> Self {
        pcc::enable(port.clock());

        let pcr = match pull {
            Pull::None => PCR_MUX_GPIO << PCR_MUX_SHIFT,
            Pull::Up => (PCR_MUX_GPIO << PCR_MUX_SHIFT) | PCR_PE | PCR_PS,
            Pull::Down => (PCR_MUX_GPIO << PCR_MUX_SHIFT) | PCR_PE,
        };
        unsafe {
            port_regs(port).pcr[pin as usize].write(pcr);
            gpio_regs(port).pddr.modify(|v| v & !(1 << pin));
        }

        Self { port, pin }
    }

    /// Get whether the pin input level is high.
    #[inline]
    pub fn is_high(&self) -> bool {
        gpio_regs(self.port).pdir.read() & (1 << self.pin) != 0
    }

    /// Get whether the pin input level is low.
    #[inline]
    pub fn is_low(&self) -> bool {
        !self.is_high()
    }

    /// Get the current pin input level.
    #[inline]
    pub fn level(&self) -> Level {
        self.is_high().into()
    }
}

impl embedded_hal::digital::ErrorType for Input {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::InputPin for Input {
    #[inline]
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Input::is_high(self))
    }

    #[inline]
    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(Input::is_low(self))
    }
}
