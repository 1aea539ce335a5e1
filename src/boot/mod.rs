//! Boot orchestration: boot-mode decision, image ingest, validation and
//! handoff.
//!
//! The hardware entry point is [`run`]; everything underneath it is a
//! host-testable engine generic over [`FlashAccess`]. The main loop is
//! cooperative: the only preemption is the LPUART interrupt, which feeds
//! the event bitset the loop polls.

use static_assertions::const_assert;

use crate::flash::{self, FlashAccess, Ftfc, SECTOR_SIZE};
use crate::flash::stream::{self, FlashStream};
use crate::gpio::Input;
use crate::queue::{self, LineQueue, MAX_LINE};
use crate::srec::{self, Kind};
use crate::uart::{Uart, EVENT_RECEIVE_COMPLETE, EVENT_SEND_COMPLETE};

/// Fixed memory layout the bootloader programs and validates against.
///
/// `flash_end`/`app_end` are exclusive; `sram_end` is inclusive, because a
/// full descending stack may legally point at the first byte past SRAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryMap {
    pub flash_start: u32,
    pub flash_end: u32,
    pub app_start: u32,
    pub app_end: u32,
    pub sram_start: u32,
    pub sram_end: u32,
    pub sector_size: u32,
}

impl MemoryMap {
    /// The production S32K144 layout: 40 KiB bootloader, application at
    /// `0xA000` with its vector table first.
    pub const S32K144: MemoryMap = MemoryMap {
        flash_start: 0x0000_0000,
        flash_end: 0x0008_0000,
        app_start: 0x0000_A000,
        app_end: 0x0008_0000,
        sram_start: 0x1FFF_8000,
        sram_end: 0x2000_7000,
        sector_size: SECTOR_SIZE as u32,
    };

    /// Number of sectors covering the application region.
    pub fn app_sector_count(&self) -> u32 {
        (self.app_end - self.app_start + self.sector_size - 1) / self.sector_size
    }
}

const_assert!(MemoryMap::S32K144.app_start % MemoryMap::S32K144.sector_size == 0);
const_assert!(MemoryMap::S32K144.app_start < MemoryMap::S32K144.app_end);
const_assert!(MemoryMap::S32K144.app_end <= MemoryMap::S32K144.flash_end);
const_assert!(MemoryMap::S32K144.sram_start < MemoryMap::S32K144.sram_end);

/// Check the two words of a candidate vector table at `base`.
///
/// An image qualifies when its initial MSP points into SRAM (erased and
/// null patterns rejected first) and its reset vector is a Thumb address
/// inside flash.
pub fn is_app_valid<F: FlashAccess>(flash: &F, map: &MemoryMap, base: u32) -> bool {
    let msp = flash.read_word(base);
    let reset = flash.read_word(base + 4);

    if msp == 0x0000_0000 || msp == 0xFFFF_FFFF {
        return false;
    }
    if msp < map.sram_start || msp > map.sram_end {
        return false;
    }
    // Cortex-M only executes Thumb; an even reset vector can't be run.
    if reset & 1 == 0 {
        return false;
    }
    let handler = reset & !1;
    if handler < map.flash_start || handler >= map.flash_end {
        return false;
    }
    true
}

/// Transfer execution to the application whose vector table sits at `base`.
///
/// Interrupts are disabled, the vector table is relocated, then the MSP is
/// reloaded from `base[0]` (with the barriers the stack switch needs) and
/// execution branches through the reset vector at `base[4]`.
///
/// # Safety
///
/// `base` must point at a valid Cortex-M vector table: word 0 a usable
/// stack pointer, word 4 a Thumb-bit reset handler. Callers gate on
/// [`is_app_valid`]. Nothing about the current execution context survives
/// the call.
pub unsafe fn jump_to_user_app(base: u32) -> ! {
    cortex_m::interrupt::disable();
    (*cortex_m::peripheral::SCB::PTR).vtor.write(base);
    cortex_m::asm::bootload(base as *const u32)
}

/// What the caller of [`Bootloader::feed`] must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Keep feeding bytes.
    None,
    /// A line exceeded the command buffer and was discarded; report it.
    LineOverflow,
    /// A complete, valid image is resident: jump to its vector table.
    Jump(u32),
}

/// S-record ingest engine.
///
/// Assembles UART bytes into lines, queues them, parses and dispatches
/// records into the phrase streamer, and decides when handoff is safe.
/// Generic over the flash device so the whole state machine runs under
/// the host test suite.
pub struct Bootloader<F> {
    flash: F,
    map: MemoryMap,
    stream: FlashStream,
    queue: LineQueue,
    line: [u8; MAX_LINE],
    line_len: usize,
    update_active: bool,
    seen_data: bool,
    flash_fault: bool,
    session_dead: bool,
    entry_point: Option<u32>,
}

impl<F: FlashAccess> Bootloader<F> {
    /// Engine over the production memory map.
    pub fn new(flash: F) -> Self {
        Self::with_map(flash, MemoryMap::S32K144)
    }

    /// Engine over an explicit memory map.
    pub fn with_map(flash: F, map: MemoryMap) -> Self {
        Self {
            flash,
            map,
            stream: FlashStream::new(map.app_start, map.app_end),
            queue: LineQueue::new(),
            line: [0; MAX_LINE],
            line_len: 0,
            update_active: false,
            seen_data: false,
            flash_fault: false,
            session_dead: false,
            entry_point: None,
        }
    }

    /// Erase every sector of the application region.
    ///
    /// Failure is fatal for the session: the engine stops accepting data
    /// until reset.
    pub fn erase_application(&mut self) -> Result<(), flash::Error> {
        let sectors = self.map.app_sector_count();
        for i in 0..sectors {
            let addr = self.map.app_start + i * self.map.sector_size;
            if let Err(e) = self.flash.erase_sector(addr) {
                self.session_dead = true;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Entry address captured from the termination record, if one arrived.
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    /// True after a fatal (erase) failure.
    pub fn session_failed(&self) -> bool {
        self.session_dead
    }

    /// Ingest one received byte.
    ///
    /// CR or LF closes the current line: it is queued (draining one line
    /// synchronously if the queue is full) and then the queue is drained
    /// to empty, parsing and dispatching every record. All recoverable
    /// errors skip the offending record and keep the session alive.
    pub fn feed(&mut self, byte: u8) -> Action {
        if self.session_dead {
            return Action::None;
        }

        match byte {
            b'\r' | b'\n' => {
                if self.line_len == 0 {
                    // Empty line (or the LF of a CRLF pair): ignore.
                    return Action::None;
                }
                let len = self.line_len;
                self.line_len = 0;

                loop {
                    match self.queue.push(&self.line[..len]) {
                        Ok(()) => break,
                        Err(queue::Error::Full) => {
                            if let Action::Jump(base) = self.process_one_queued_line() {
                                return Action::Jump(base);
                            }
                        }
                        // 1..=MAX_LINE bytes by construction.
                        Err(_) => return Action::None,
                    }
                }
                self.drain_queue()
            }
            _ => {
                if self.line_len < MAX_LINE {
                    self.line[self.line_len] = byte;
                    self.line_len += 1;
                    Action::None
                } else {
                    // Discard the oversized partial line.
                    self.line_len = 0;
                    Action::LineOverflow
                }
            }
        }
    }

    fn drain_queue(&mut self) -> Action {
        let mut out = [0u8; MAX_LINE];
        loop {
            let n = match self.queue.pop_into(&mut out) {
                Ok(n) => n,
                Err(_) => return Action::None,
            };
            if let Action::Jump(base) = self.handle_line_buf(&out[..n]) {
                return Action::Jump(base);
            }
        }
    }

    fn process_one_queued_line(&mut self) -> Action {
        let mut out = [0u8; MAX_LINE];
        match self.queue.pop_into(&mut out) {
            Ok(n) => self.handle_line_buf(&out[..n]),
            Err(_) => Action::None,
        }
    }

    fn handle_line_buf(&mut self, line: &[u8]) -> Action {
        match srec::parse(line) {
            Ok(record) => self.dispatch(record.kind, record.address, record.data()),
            Err(_e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("srec: line rejected: {}", _e);
                Action::None
            }
        }
    }

    fn dispatch(&mut self, kind: Kind, address: u32, data: &[u8]) -> Action {
        match kind {
            Kind::Data16 | Kind::Data24 | Kind::Data32 => {
                self.update_active = true;
                match self.stream.write(&mut self.flash, address, data) {
                    Ok(()) => self.seen_data = true,
                    Err(stream::Error::Flash(_e)) => {
                        // The image is now inconsistent; finish the
                        // session but never hand off to it.
                        self.flash_fault = true;
                        #[cfg(feature = "defmt")]
                        defmt::warn!("flash: program failed: {}", _e);
                    }
                    Err(_e) => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("stream: record rejected: {}", _e);
                    }
                }
                Action::None
            }
            Kind::Term16 | Kind::Term24 | Kind::Term32 => {
                if let Err(e) = self.stream.finish(&mut self.flash) {
                    if matches!(e, stream::Error::Flash(_)) {
                        self.flash_fault = true;
                    }
                    return Action::None;
                }
                self.entry_point = Some(address);

                if self.update_active
                    && self.seen_data
                    && !self.flash_fault
                    && is_app_valid(&self.flash, &self.map, self.map.app_start)
                {
                    Action::Jump(self.map.app_start)
                } else {
                    Action::None
                }
            }
            // Header and count records carry nothing to program.
            Kind::Header | Kind::Count16 => Action::None,
        }
    }
}

// ==========
// hardware main loop

const BANNER_ERASE: &[u8] = b"\r\n*** ERASE PROCESSING ***\r\n";
const BANNER_READY: &[u8] = b"\r\n*** UART BOOTLOADER READY TO SENT ***\r\n";
const BANNER_SEND_FILE: &[u8] = b"\r\n*** PLEASE SEND SREC FILE ***\r\n";
const BANNER_OVERFLOW: &[u8] = b"\r\nError: Command too long\r\n";
const BANNER_ERASE_FAILED: &[u8] = b"\r\nError: Flash erase failed\r\n";

/// Interrupt-driven send, spinning on the completion event.
fn send_banner(uart: &mut Uart, msg: &'static [u8]) {
    if uart.send(msg).is_err() {
        return;
    }
    while uart.events() & EVENT_SEND_COMPLETE == 0 {}
    uart.clear_events(EVENT_SEND_COMPLETE);
}

/// Run the bootloader. Never returns; exits only via handoff or reset.
///
/// With the boot pin high (button released: pulled up, button to ground)
/// and a valid image resident, control goes straight to the application.
/// Otherwise the application region is erased and the UART ingest loop
/// runs until a terminator record completes a valid image.
pub fn run(mut uart: Uart, boot_pin: Input, flash: Ftfc) -> ! {
    let map = MemoryMap::S32K144;

    if boot_pin.is_high() && is_app_valid(&flash, &map, map.app_start) {
        unsafe { jump_to_user_app(map.app_start) }
    }

    let mut boot = Bootloader::with_map(flash, map);

    send_banner(&mut uart, BANNER_ERASE);
    if boot.erase_application().is_err() {
        send_banner(&mut uart, BANNER_ERASE_FAILED);
        loop {
            cortex_m::asm::wfi();
        }
    }

    send_banner(&mut uart, BANNER_READY);
    send_banner(&mut uart, BANNER_SEND_FILE);

    let mut rx = [0u8; 1];
    if uart.receive(1).is_err() {
        loop {
            cortex_m::asm::wfi();
        }
    }

    loop {
        if uart.events() & EVENT_RECEIVE_COMPLETE != 0 {
            uart.clear_events(EVENT_RECEIVE_COMPLETE);
            let n = uart.take_received(&mut rx);
            // Re-arm before the potentially slow flash work below; the
            // queue absorbs what arrives meanwhile.
            let _ = uart.receive(1);
            if n == 0 {
                continue;
            }

            match boot.feed(rx[0]) {
                Action::None => {}
                Action::LineOverflow => send_banner(&mut uart, BANNER_OVERFLOW),
                Action::Jump(base) => unsafe { jump_to_user_app(base) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::flash::mock::MockFlash;
    use crate::testutil::build_line;

    /// Map with the application window starting at zero, for sessions
    /// whose records carry low test addresses.
    fn low_map() -> MemoryMap {
        MemoryMap {
            flash_start: 0x0000,
            flash_end: 0x1_0000,
            app_start: 0x0000,
            app_end: 0x1_0000,
            sram_start: 0x1FFF_8000,
            sram_end: 0x2000_7000,
            sector_size: SECTOR_SIZE as u32,
        }
    }

    /// Production-shaped map shrunk to a 4 KiB application window.
    fn small_app_map() -> MemoryMap {
        MemoryMap {
            app_end: 0xB000,
            flash_end: 0x1_0000,
            ..MemoryMap::S32K144
        }
    }

    fn feed_line(boot: &mut Bootloader<MockFlash>, line: &str) -> Action {
        let mut action = Action::None;
        for &b in line.as_bytes() {
            match boot.feed(b) {
                Action::None => {}
                other => action = other,
            }
        }
        match boot.feed(b'\n') {
            Action::None => action,
            other => other,
        }
    }

    // A vector table image: MSP in SRAM, Thumb reset handler in flash.
    const VALID_VECTORS: [u8; 8] = [0x00, 0x00, 0x00, 0x20, 0x41, 0xA0, 0x00, 0x00];

    #[test]
    fn validator_accepts_a_sane_vector_table() {
        let mut flash = MockFlash::new(0xA000, 0x1000);
        flash.preload(0xA000, &VALID_VECTORS);
        assert!(is_app_valid(&flash, &small_app_map(), 0xA000));
    }

    #[test]
    fn validator_rejects_null_and_erased_msp() {
        let map = small_app_map();
        let mut flash = MockFlash::new(0xA000, 0x1000);
        assert!(!is_app_valid(&flash, &map, 0xA000));
        flash.preload_word(0xA000, 0x0000_0000);
        flash.preload_word(0xA004, 0x0000_A041);
        assert!(!is_app_valid(&flash, &map, 0xA000));
    }

    #[test]
    fn validator_rejects_msp_outside_sram() {
        let map = small_app_map();
        let mut flash = MockFlash::new(0xA000, 0x1000);
        flash.preload_word(0xA004, 0x0000_A041);

        flash.preload_word(0xA000, 0x1FFF_7FFC);
        assert!(!is_app_valid(&flash, &map, 0xA000));
        flash.preload_word(0xA000, 0x2000_7004);
        assert!(!is_app_valid(&flash, &map, 0xA000));
        // The inclusive top-of-stack bound is fine.
        flash.preload_word(0xA000, 0x2000_7000);
        assert!(is_app_valid(&flash, &map, 0xA000));
    }

    #[test]
    fn validator_rejects_non_thumb_or_out_of_flash_reset() {
        let map = small_app_map();
        let mut flash = MockFlash::new(0xA000, 0x1000);
        flash.preload_word(0xA000, 0x2000_0000);

        flash.preload_word(0xA004, 0x0000_A040);
        assert!(!is_app_valid(&flash, &map, 0xA000));
        flash.preload_word(0xA004, 0x0002_0001);
        assert!(!is_app_valid(&flash, &map, 0xA000));
    }

    #[test]
    fn full_session_streams_and_stays_resident_on_a_dead_image() {
        // Zero-filled flash: everything programs, but the image the
        // terminator validates is all nulls, so no handoff happens.
        let mut boot = Bootloader::with_map(MockFlash::filled(0, 0x1000, 0x00), low_map());
        let data: [u8; 20] = core::array::from_fn(|i| i as u8 + 0x30);

        assert_eq!(
            feed_line(&mut boot, "S00F000068656C6C6F202020202000003C"),
            Action::None
        );
        assert_eq!(feed_line(&mut boot, &build_line('1', 0x0000, &data)), Action::None);
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);

        // 20 bytes from 0x0 touch exactly three phrase bases.
        assert_eq!(boot.flash.programs, 3);
        assert_eq!(boot.flash.program_bases, [0x00, 0x08, 0x10]);
        assert_eq!(boot.entry_point(), Some(0));
        assert!(boot.update_active && boot.seen_data);
    }

    #[test]
    fn complete_valid_image_requests_handoff() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());

        assert_eq!(
            feed_line(&mut boot, &build_line('1', 0xA000, &VALID_VECTORS)),
            Action::None
        );
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::Jump(0xA000));
        assert_eq!(boot.flash.programs, 1);
        assert_eq!(boot.flash.bytes(0xA000, 8), VALID_VECTORS);
    }

    #[test]
    fn corrupt_checksum_reaches_neither_streamer_nor_queue() {
        let mut boot = Bootloader::with_map(MockFlash::new(0, 0x1000), low_map());

        let line = build_line('1', 0x0000, &[1, 2, 3, 4]);
        let mut bad = line.into_bytes();
        *bad.last_mut().unwrap() ^= 0x01;
        let bad = std::string::String::from_utf8(bad).unwrap();

        assert_eq!(feed_line(&mut boot, &bad), Action::None);
        assert_eq!(boot.flash.programs, 0);
        assert!(boot.queue.is_empty());
        assert!(!boot.seen_data);
    }

    #[test]
    fn write_into_the_bootloader_region_touches_no_flash() {
        let mut boot = Bootloader::new(MockFlash::new(0, 0x100));

        let line = build_line('3', 0x0000_8000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(feed_line(&mut boot, &line), Action::None);

        assert_eq!(boot.flash.programs, 0);
        assert_eq!(boot.flash.erases, 0);
        assert_eq!(boot.flash.reads.get(), 0);
        assert!(!boot.seen_data);
    }

    #[test]
    fn adjacent_half_phrase_records_coalesce_into_one_program() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());

        feed_line(&mut boot, &build_line('1', 0xA000, &[1, 2, 3, 4]));
        feed_line(&mut boot, &build_line('1', 0xA004, &[5, 6, 7, 8]));
        assert_eq!(boot.flash.programs, 0);

        feed_line(&mut boot, "S9030000FC");
        assert_eq!(boot.flash.programs, 1);
        assert_eq!(boot.flash.program_bases, [0xA000]);
    }

    #[test]
    fn rejected_image_keeps_the_session_accepting_records() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());
        // Erased MSP, bogus reset handler: the validator must say no.
        boot.flash.preload_word(0xA004, 0x0000_A001);

        feed_line(&mut boot, &build_line('1', 0xA100, &[1, 2, 3, 4]));
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);

        let before = boot.flash.programs;
        feed_line(&mut boot, &build_line('1', 0xA200, &[5, 6, 7, 8]));
        feed_line(&mut boot, "S9030000FC");
        assert!(boot.flash.programs > before);
    }

    #[test]
    fn pre_erase_covers_every_application_sector() {
        let map = MemoryMap::S32K144;
        let len = (map.app_end - map.app_start) as usize;
        let mut boot = Bootloader::new(MockFlash::new(map.app_start, len));

        boot.erase_application().unwrap();
        assert_eq!(boot.flash.erases as u32, map.app_sector_count());
        assert_eq!(boot.flash.erases, 118);
    }

    #[test]
    fn erase_failure_kills_the_session() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());
        boot.flash.fail_erase = true;

        assert!(boot.erase_application().is_err());
        assert!(boot.session_failed());

        feed_line(&mut boot, &build_line('1', 0xA000, &VALID_VECTORS));
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);
        assert_eq!(boot.flash.programs, 0);
    }

    #[test]
    fn flash_fault_blocks_handoff_for_the_rest_of_the_session() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());
        boot.flash.fail_program = true;

        feed_line(&mut boot, &build_line('1', 0xA000, &VALID_VECTORS));
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);

        // Even a clean retry of the same image must stay resident.
        boot.flash.fail_program = false;
        feed_line(&mut boot, &build_line('1', 0xA000, &VALID_VECTORS));
        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);
    }

    #[test]
    fn terminator_without_data_does_not_jump() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());
        // A perfectly valid image is already resident.
        boot.flash.preload(0xA000, &VALID_VECTORS);

        assert_eq!(feed_line(&mut boot, "S9030000FC"), Action::None);
    }

    #[test]
    fn oversized_line_is_reported_and_discarded() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());

        for _ in 0..MAX_LINE {
            assert_eq!(boot.feed(b'A'), Action::None);
        }
        assert_eq!(boot.feed(b'A'), Action::LineOverflow);
        assert_eq!(boot.feed(b'\n'), Action::None);

        // The assembler recovers for the next line.
        feed_line(&mut boot, &build_line('1', 0xA000, &[0x11; 8]));
        feed_line(&mut boot, "S9030000FC");
        assert_eq!(boot.flash.programs, 1);
    }

    #[test]
    fn crlf_pairs_and_blank_lines_are_ignored() {
        let mut boot = Bootloader::with_map(MockFlash::new(0xA000, 0x1000), small_app_map());

        for &b in b"\r\n\r\n" {
            assert_eq!(boot.feed(b), Action::None);
        }
        let line = build_line('1', 0xA000, &[0x22; 4]);
        for &b in line.as_bytes() {
            boot.feed(b);
        }
        assert_eq!(boot.feed(b'\r'), Action::None);
        assert_eq!(boot.feed(b'\n'), Action::None);
        assert!(boot.update_active);
    }
}
