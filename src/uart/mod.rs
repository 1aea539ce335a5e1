//! UART, LPUART serial driver.
//!
//! Interrupt-driven byte transport for the bootloader's ingest path plus
//! blocking variants for the banners that go out before the interrupt is
//! armed. The driver targets LPUART1 on PTC6/PTC7, clocked from SOSCDIV2
//! (8 MHz on the evaluation board).
//!
//! Completion is reported through a single event bitset: the interrupt
//! handler only ever ORs bits in, the main loop clears the bits it has
//! observed. Both transfer directions bounce through driver-owned buffers,
//! so the interrupt handler never touches caller memory.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use cortex_m::peripheral::NVIC;
use volatile_register::RW;

use crate::gpio::{self, Port};
use crate::pcc;
use crate::Interrupt;

const LPUART1_BASE: usize = 0x4006_B000;

#[repr(C)]
struct RegisterBlock {
    // VERID, PARAM, GLOBAL, PINCFG
    _reserved0: [u32; 4],
    baud: RW<u32>,
    stat: RW<u32>,
    ctrl: RW<u32>,
    data: RW<u32>,
}

// BAUD fields.
const BAUD_SBNS: u32 = 1 << 13;
const BAUD_OSR_SHIFT: u32 = 24;
// STAT flags. OR/NF/FE/PF are W1C.
const STAT_TDRE: u32 = 1 << 23;
const STAT_TC: u32 = 1 << 22;
const STAT_RDRF: u32 = 1 << 21;
const STAT_OR: u32 = 1 << 19;
const STAT_NF: u32 = 1 << 18;
const STAT_FE: u32 = 1 << 17;
const STAT_PF: u32 = 1 << 16;
const STAT_ERROR_FLAGS: u32 = STAT_OR | STAT_NF | STAT_FE | STAT_PF;
// CTRL fields.
const CTRL_TIE: u32 = 1 << 23;
const CTRL_TCIE: u32 = 1 << 22;
const CTRL_RIE: u32 = 1 << 21;
const CTRL_ILIE: u32 = 1 << 20;
const CTRL_TE: u32 = 1 << 19;
const CTRL_RE: u32 = 1 << 18;
const CTRL_M: u32 = 1 << 4;
const CTRL_PE: u32 = 1 << 1;
const CTRL_PT: u32 = 1 << 0;

const UART_RETRY_COUNT: u32 = 5000;
/// Spin bound for the polling receive path.
const RX_TIMEOUT_LOOP: u32 = 1_000_000;

const LPUART1_IRQ_PRIORITY: u8 = 5;

/// Largest transfer either direction accepts in one call.
pub const TX_BUFFER_SIZE: usize = 256;
pub const RX_BUFFER_SIZE: usize = 256;

/// A queued send finished; the last byte is in the shifter.
pub const EVENT_SEND_COMPLETE: u32 = 1 << 0;
/// An armed receive collected its final byte.
pub const EVENT_RECEIVE_COMPLETE: u32 = 1 << 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Word length, number of data bits
pub enum DataBits {
    /// 8 Data Bits
    DataBits8,
    /// 9 Data Bits
    DataBits9,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Parity
pub enum Parity {
    /// No parity
    ParityNone,
    /// Even Parity
    ParityEven,
    /// Odd Parity
    ParityOdd,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Number of stop bits
pub enum StopBits {
    #[doc = "1 stop bit"]
    STOP1,
    #[doc = "2 stop bits"]
    STOP2,
}

/// Line discipline. Only asynchronous operation is implemented.
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Asynchronous,
    SingleWire,
}

/// Power states, from gated-off to fully operational.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Clock gated, all activity stopped.
    Off,
    /// Clocked but idle: transmitter, receiver and interrupts disabled.
    Low,
    /// Clocked with the NVIC path armed.
    Full,
}

#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Baud rate
    pub baudrate: u32,
    /// Number of data bits
    pub data_bits: DataBits,
    /// Number of stop bits
    pub stop_bits: StopBits,
    /// Parity type
    pub parity: Parity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baudrate: 19_200,
            data_bits: DataBits::DataBits8,
            stop_bits: StopBits::STOP1,
            parity: Parity::ParityNone,
        }
    }
}

/// Serial error
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Null-equivalent or out-of-bounds argument
    Parameter,
    /// A transfer in this direction is already active
    Busy,
    /// Requested baud rate is not in the divisor table
    Baudrate,
    /// Requested mode or framing is not supported
    Unsupported,
    /// Bounded wait expired
    Timeout,
    /// RX data register overrun
    Overrun,
    /// Framing error
    Framing,
    /// Parity check error
    Parity,
    /// Noise flag on a received byte
    Noise,
}

/// Snapshot of the transfer and line status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub tx_busy: bool,
    pub rx_busy: bool,
    pub rx_overrun: bool,
    pub rx_framing_error: bool,
    pub rx_parity_error: bool,
    pub rx_noise: bool,
}

/// Shared ISR/main-loop state.
///
/// Ownership of the bounce buffers follows the busy flags: the main loop
/// owns a buffer while its busy flag is clear, the interrupt handler owns
/// it while the flag is set. The flags are the only synchronization.
struct State {
    events: AtomicU32,
    tx_busy: AtomicBool,
    rx_busy: AtomicBool,
    tx_len: AtomicUsize,
    tx_pos: AtomicUsize,
    rx_len: AtomicUsize,
    rx_pos: AtomicUsize,
    tx_count: AtomicU32,
    rx_count: AtomicU32,
    rx_overrun: AtomicBool,
    rx_framing: AtomicBool,
    rx_parity: AtomicBool,
    rx_noise: AtomicBool,
    tx_buf: UnsafeCell<[u8; TX_BUFFER_SIZE]>,
    rx_buf: UnsafeCell<[u8; RX_BUFFER_SIZE]>,
}

unsafe impl Sync for State {}

impl State {
    const fn new() -> Self {
        Self {
            events: AtomicU32::new(0),
            tx_busy: AtomicBool::new(false),
            rx_busy: AtomicBool::new(false),
            tx_len: AtomicUsize::new(0),
            tx_pos: AtomicUsize::new(0),
            rx_len: AtomicUsize::new(0),
            rx_pos: AtomicUsize::new(0),
            tx_count: AtomicU32::new(0),
            rx_count: AtomicU32::new(0),
            rx_overrun: AtomicBool::new(false),
            rx_framing: AtomicBool::new(false),
            rx_parity: AtomicBool::new(false),
            rx_noise: AtomicBool::new(false),
            tx_buf: UnsafeCell::new([0; TX_BUFFER_SIZE]),
            rx_buf: UnsafeCell::new([0; RX_BUFFER_SIZE]),
        }
    }
}

static STATE: State = State::new();

fn regs() -> &'static RegisterBlock {
    unsafe { &*(LPUART1_BASE as *const RegisterBlock) }
}

/// LPUART1 driver.
pub struct Uart {
    power: PowerState,
}

impl Uart {
    /// Bring up LPUART1 on PTC6 (RX) / PTC7 (TX) with `config`.
    ///
    /// Performs the full init/power/configure/enable sequence and arms the
    /// NVIC path; afterwards the driver is ready for interrupt-driven
    /// transfers.
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut uart = Uart { power: PowerState::Off };
        uart.init();
        uart.power(PowerState::Full)?;
        uart.configure(Mode::Asynchronous, &config)?;
        uart.enable_tx(true);
        uart.enable_rx(true);
        Ok(uart)
    }

    fn init(&mut self) {
        // PTC6 = LPUART1_RX, PTC7 = LPUART1_TX, both ALT2.
        gpio::set_alt_function(Port::C, 6, 2);
        gpio::set_alt_function(Port::C, 7, 2);

        pcc::enable_with_source(pcc::Clock::Lpuart1, pcc::ClockSource::SoscDiv2);

        let r = regs();
        unsafe {
            r.ctrl.modify(|v| v & !(CTRL_TE | CTRL_RE));
            r.baud.write(0);
        }
    }

    /// Move the driver between power states.
    pub fn power(&mut self, state: PowerState) -> Result<(), Error> {
        let r = regs();
        match state {
            PowerState::Off => {
                unsafe {
                    r.ctrl.modify(|v| {
                        v & !(CTRL_TE | CTRL_RE | CTRL_TIE | CTRL_TCIE | CTRL_RIE | CTRL_ILIE)
                    });
                    r.stat.write(STAT_ERROR_FLAGS);
                }
                pcc::disable(pcc::Clock::Lpuart1);
            }
            PowerState::Low => {
                pcc::enable(pcc::Clock::Lpuart1);
                unsafe {
                    r.ctrl.modify(|v| {
                        v & !(CTRL_TE | CTRL_RE | CTRL_TIE | CTRL_TCIE | CTRL_RIE | CTRL_ILIE)
                    });
                }
            }
            PowerState::Full => {
                pcc::enable(pcc::Clock::Lpuart1);
                NVIC::unpend(Interrupt::Lpuart1RxTx);
                unsafe {
                    // 4 priority bits, in the MSBs of the byte.
                    (*NVIC::PTR).ipr[Interrupt::Lpuart1RxTx as usize]
                        .write(LPUART1_IRQ_PRIORITY << 4);
                    NVIC::unmask(Interrupt::Lpuart1RxTx);
                }
            }
        }
        self.power = state;
        Ok(())
    }

    /// Apply line settings. Transmitter and receiver must be re-enabled
    /// afterwards with [`enable_tx`](Self::enable_tx) / [`enable_rx`](Self::enable_rx).
    pub fn configure(&mut self, mode: Mode, config: &Config) -> Result<(), Error> {
        if mode != Mode::Asynchronous {
            return Err(Error::Unsupported);
        }

        let r = regs();
        let mut baud = baud_divisor(config.baudrate)?;
        if config.stop_bits == StopBits::STOP2 {
            baud |= BAUD_SBNS;
        }

        unsafe {
            r.ctrl.modify(|v| v & !(CTRL_TE | CTRL_RE));
            r.baud.write(baud);
            r.ctrl.modify(|v| {
                let mut v = v & !(CTRL_M | CTRL_PE | CTRL_PT);
                if config.data_bits == DataBits::DataBits9 {
                    v |= CTRL_M;
                }
                match config.parity {
                    Parity::ParityNone => {}
                    Parity::ParityEven => v |= CTRL_PE,
                    Parity::ParityOdd => v |= CTRL_PE | CTRL_PT,
                }
                v
            });
        }
        Ok(())
    }

    /// Gate the transmitter.
    pub fn enable_tx(&mut self, on: bool) {
        unsafe {
            regs()
                .ctrl
                .modify(|v| if on { v | CTRL_TE } else { v & !CTRL_TE });
        }
    }

    /// Gate the receiver. Enabling also arms the receive interrupt.
    pub fn enable_rx(&mut self, on: bool) {
        unsafe {
            regs().ctrl.modify(|v| {
                if on {
                    v | CTRL_RE | CTRL_RIE
                } else {
                    v & !CTRL_RE
                }
            });
        }
    }

    /// Start an interrupt-driven send of `data`.
    ///
    /// The bytes are copied into a driver-owned buffer, so `data` may go
    /// away immediately. Completion is signalled with
    /// [`EVENT_SEND_COMPLETE`].
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() || data.len() > TX_BUFFER_SIZE {
            return Err(Error::Parameter);
        }
        if STATE.tx_busy.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }

        // tx_busy is clear, so the main loop owns the buffer.
        unsafe {
            (&mut *STATE.tx_buf.get())[..data.len()].copy_from_slice(data);
        }
        STATE.tx_len.store(data.len(), Ordering::Relaxed);
        STATE.tx_pos.store(0, Ordering::Relaxed);
        STATE.tx_count.store(0, Ordering::Relaxed);
        STATE.tx_busy.store(true, Ordering::Release);

        let r = regs();
        if r.stat.read() & STAT_TDRE != 0 {
            // Prime the data register so the first interrupt already has
            // the shifter draining behind it.
            unsafe { r.data.write(data[0] as u32) };
            STATE.tx_pos.store(1, Ordering::Relaxed);
            STATE.tx_count.store(1, Ordering::Relaxed);
        }
        unsafe { r.ctrl.modify(|v| v | CTRL_TIE) };
        Ok(())
    }

    /// Arm reception of `len` bytes (1..=[`RX_BUFFER_SIZE`]).
    ///
    /// The interrupt handler collects into a driver-owned buffer and ORs
    /// [`EVENT_RECEIVE_COMPLETE`] when the count is reached; fetch the
    /// bytes with [`take_received`](Self::take_received).
    pub fn receive(&mut self, len: usize) -> Result<(), Error> {
        if len == 0 || len > RX_BUFFER_SIZE {
            return Err(Error::Parameter);
        }
        if STATE.rx_busy.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }

        STATE.rx_len.store(len, Ordering::Relaxed);
        STATE.rx_pos.store(0, Ordering::Relaxed);
        STATE.rx_count.store(0, Ordering::Relaxed);
        STATE.rx_busy.store(true, Ordering::Release);

        unsafe { regs().ctrl.modify(|v| v | CTRL_RIE) };
        Ok(())
    }

    /// Copy out the bytes of a completed receive.
    ///
    /// Returns 0 while a receive is still in flight.
    pub fn take_received(&mut self, out: &mut [u8]) -> usize {
        if STATE.rx_busy.load(Ordering::Acquire) {
            return 0;
        }
        let n = STATE.rx_pos.load(Ordering::Relaxed).min(out.len());
        // rx_busy is clear, so the main loop owns the buffer.
        unsafe {
            out[..n].copy_from_slice(&(&*STATE.rx_buf.get())[..n]);
        }
        n
    }

    /// Event bits accumulated by the interrupt handler.
    #[inline]
    pub fn events(&self) -> u32 {
        STATE.events.load(Ordering::Acquire)
    }

    /// Clear the given event bits after observing them.
    #[inline]
    pub fn clear_events(&mut self, mask: u32) {
        STATE.events.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Bytes pushed out by the current/last send.
    pub fn tx_count(&self) -> u32 {
        STATE.tx_count.load(Ordering::Relaxed)
    }

    /// Bytes collected by the current/last receive.
    pub fn rx_count(&self) -> u32 {
        STATE.rx_count.load(Ordering::Relaxed)
    }

    /// Current power state.
    pub fn power_state(&self) -> PowerState {
        self.power
    }

    /// Transfer and sticky line status.
    pub fn status(&self) -> Status {
        Status {
            tx_busy: STATE.tx_busy.load(Ordering::Relaxed),
            rx_busy: STATE.rx_busy.load(Ordering::Relaxed),
            rx_overrun: STATE.rx_overrun.load(Ordering::Relaxed),
            rx_framing_error: STATE.rx_framing.load(Ordering::Relaxed),
            rx_parity_error: STATE.rx_parity.load(Ordering::Relaxed),
            rx_noise: STATE.rx_noise.load(Ordering::Relaxed),
        }
    }

    /// Perform a blocking UART write
    pub fn blocking_write(&mut self, buffer: &[u8]) -> Result<(), Error> {
        let r = regs();

        for &b in buffer {
            let mut retry = 0_u32;
            while r.stat.read() & STAT_TDRE == 0 {
                if retry > UART_RETRY_COUNT {
                    return Err(Error::Timeout);
                }
                retry += 1;
            }
            unsafe { r.data.write(b as u32) };
        }
        Ok(())
    }

    /// Block until transmission complete
    pub fn blocking_flush(&mut self) -> Result<(), Error> {
        let r = regs();
        let mut retry = 0_u32;

        while r.stat.read() & STAT_TC == 0 {
            if retry > UART_RETRY_COUNT {
                return Err(Error::Timeout);
            }
            retry += 1;
        }
        Ok(())
    }

    /// Perform a bounded polling read into `buffer`.
    ///
    /// The degenerate pre-interrupt path: spins on RDRF with a fixed
    /// iteration bound per byte and reports line errors as they appear.
    pub fn blocking_read(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer {
            let mut spin = 0_u32;
            loop {
                match self.nb_read() {
                    Ok(byte) => {
                        *b = byte;
                        break;
                    }
                    Err(nb::Error::WouldBlock) => {
                        if spin > RX_TIMEOUT_LOOP {
                            return Err(Error::Timeout);
                        }
                        spin += 1;
                    }
                    Err(nb::Error::Other(e)) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Read a single u8 if there is one available, otherwise return WouldBlock
    pub fn nb_read(&mut self) -> Result<u8, nb::Error<Error>> {
        let r = regs();
        let stat = r.stat.read();

        if stat & STAT_ERROR_FLAGS != 0 {
            unsafe { r.stat.write(stat & STAT_ERROR_FLAGS) };
            if stat & STAT_PF != 0 {
                return Err(nb::Error::Other(Error::Parity));
            } else if stat & STAT_FE != 0 {
                return Err(nb::Error::Other(Error::Framing));
            } else if stat & STAT_OR != 0 {
                return Err(nb::Error::Other(Error::Overrun));
            }
            return Err(nb::Error::Other(Error::Noise));
        }

        if stat & STAT_RDRF != 0 {
            Ok((r.data.read() & 0xFF) as u8)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

/// LPUART1 interrupt body; call from the `LPUART1_RxTx` vector.
pub fn on_interrupt() {
    let r = regs();
    let stat = r.stat.read();
    let ctrl = r.ctrl.read();

    // Latch and clear line errors first; RDRF handling below still sees
    // the byte that carried them.
    if stat & STAT_ERROR_FLAGS != 0 {
        unsafe { r.stat.write(stat & STAT_ERROR_FLAGS) };
        if stat & STAT_OR != 0 {
            STATE.rx_overrun.store(true, Ordering::Relaxed);
        }
        if stat & STAT_FE != 0 {
            STATE.rx_framing.store(true, Ordering::Relaxed);
        }
        if stat & STAT_PF != 0 {
            STATE.rx_parity.store(true, Ordering::Relaxed);
        }
        if stat & STAT_NF != 0 {
            STATE.rx_noise.store(true, Ordering::Relaxed);
        }
    }

    if stat & STAT_TDRE != 0 && ctrl & CTRL_TIE != 0 {
        if STATE.tx_busy.load(Ordering::Acquire) {
            let pos = STATE.tx_pos.load(Ordering::Relaxed);
            let len = STATE.tx_len.load(Ordering::Relaxed);
            if pos < len {
                let b = unsafe { (*STATE.tx_buf.get())[pos] };
                unsafe { r.data.write(b as u32) };
                STATE.tx_pos.store(pos + 1, Ordering::Relaxed);
                STATE.tx_count.fetch_add(1, Ordering::Relaxed);
            } else {
                unsafe { r.ctrl.modify(|v| v & !CTRL_TIE) };
                STATE.tx_busy.store(false, Ordering::Release);
                STATE.events.fetch_or(EVENT_SEND_COMPLETE, Ordering::Release);
            }
        } else {
            // Stray TDRE with no send active.
            unsafe { r.ctrl.modify(|v| v & !CTRL_TIE) };
        }
    }

    if stat & STAT_RDRF != 0 {
        // Reading DATA clears RDRF.
        let byte = (r.data.read() & 0xFF) as u8;

        if STATE.rx_busy.load(Ordering::Acquire) {
            let pos = STATE.rx_pos.load(Ordering::Relaxed);
            let len = STATE.rx_len.load(Ordering::Relaxed);
            unsafe {
                (*STATE.rx_buf.get())[pos] = byte;
            }
            STATE.rx_pos.store(pos + 1, Ordering::Relaxed);
            STATE.rx_count.fetch_add(1, Ordering::Relaxed);

            if pos + 1 >= len {
                STATE.rx_busy.store(false, Ordering::Release);
                STATE
                    .events
                    .fetch_or(EVENT_RECEIVE_COMPLETE, Ordering::Release);
            }
        }
        // Not armed: the byte is discarded.
    }
}

/// BAUD register value for a supported rate, from the 8 MHz SOSCDIV2 source.
///
/// 16x oversampling everywhere except 115200, which needs 23x to land
/// within tolerance (~+0.64%).
fn baud_divisor(baudrate: u32) -> Result<u32, Error> {
    const fn osr16(sbr: u32) -> u32 {
        (15 << BAUD_OSR_SHIFT) | sbr
    }

    let value = match baudrate {
        1_200 => osr16(417),
        2_400 => osr16(208),
        4_800 => osr16(104),
        9_600 => osr16(52),
        19_200 => osr16(26),
        38_400 => osr16(13),
        // 8 MHz / (16 * 9) = 55555, -3.5%
        57_600 => osr16(9),
        115_200 => (22 << BAUD_OSR_SHIFT) | 3,
        _ => return Err(Error::Baudrate),
    };
    Ok(value)
}

// ==========
// traits

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl embedded_io::ErrorType for Uart {
    type Error = Error;
}

impl embedded_io::Write for Uart {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.blocking_write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.blocking_flush()
    }
}
