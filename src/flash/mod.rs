//! FTFC, program flash controller.
//!
//! Thin gateway over the command-sequence state machine: load the common
//! command object, launch, poll the completion flag, decode the error
//! bits. The two commands the bootloader needs are phrase program and
//! sector erase; word reads go straight through the bus.

use embedded_storage::nor_flash::NorFlashErrorKind;
use volatile_register::RW;

use crate::pcc;

pub mod stream;

#[cfg(test)]
pub(crate) mod mock;

pub use stream::FlashStream;

/// Smallest programmable unit, always 8-aligned.
pub const PHRASE_SIZE: usize = 8;
/// Smallest erasable unit of S32K144 program flash.
pub const SECTOR_SIZE: usize = 4096;
/// Program flash capacity.
pub const FLASH_SIZE: usize = 512 * 1024;

const FTFC_BASE: usize = 0x4002_0000;

#[repr(C)]
struct RegisterBlock {
    fstat: RW<u8>,
    // FCNFG, FSEC, FOPT
    _reserved0: [u8; 3],
    // The command object bytes live big-endian within each 32-bit word:
    // offset 4 is FCCOB3, offset 7 is FCCOB0, and so on. fccob_index()
    // maps the datasheet numbering onto this layout.
    fccob: [RW<u8>; 12],
}

// FSTAT flags. ACCERR and FPVIOL are W1C, CCIF launches on write.
const FSTAT_CCIF: u8 = 0x80;
const FSTAT_ACCERR: u8 = 0x20;
const FSTAT_FPVIOL: u8 = 0x10;
const FSTAT_MGSTAT0: u8 = 0x01;

// Command codes.
const CMD_PROGRAM_PHRASE: u8 = 0x07;
const CMD_ERASE_SECTOR: u8 = 0x09;

/// Decoded FSTAT snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerStatus {
    /// CCIF: no command in flight.
    pub complete: bool,
    pub access_error: bool,
    pub protection_violation: bool,
    pub command_fault: bool,
}

/// Flash controller error, decoded from FSTAT after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// ACCERR: invalid command, address or sequence.
    AccessError,
    /// FPVIOL: target address is write-protected.
    ProtectionViolation,
    /// MGSTAT0: the command ran and failed (verify or margin fault).
    CommandFault,
}

fn check_fstat(fstat: u8) -> Result<(), Error> {
    if fstat & FSTAT_ACCERR != 0 {
        Err(Error::AccessError)
    } else if fstat & FSTAT_FPVIOL != 0 {
        Err(Error::ProtectionViolation)
    } else if fstat & FSTAT_MGSTAT0 != 0 {
        Err(Error::CommandFault)
    } else {
        Ok(())
    }
}

/// Word reads plus the two command primitives the bootloader needs.
///
/// Implemented by [`Ftfc`] for the device and by test doubles for the
/// streamer, validator and orchestrator suites.
pub trait FlashAccess {
    /// Read one aligned 32-bit word from flash address space.
    fn read_word(&self, addr: u32) -> u32;

    /// Erase the sector containing `addr` (which must be sector-aligned).
    fn erase_sector(&mut self, addr: u32) -> Result<(), Error>;

    /// Program one previously erased, 8-aligned phrase.
    fn program_phrase(&mut self, addr: u32, data: &[u8; PHRASE_SIZE]) -> Result<(), Error>;
}

/// Flash controller driver.
pub struct Ftfc {
    _private: (),
}

impl Ftfc {
    /// Take the flash controller, opening its clock gate.
    pub fn new() -> Self {
        pcc::enable(pcc::Clock::Ftfc);
        Ftfc { _private: () }
    }

    fn regs() -> &'static RegisterBlock {
        unsafe { &*(FTFC_BASE as *const RegisterBlock) }
    }

    // FCCOBn of the datasheet -> index into the byte array above.
    fn fccob_index(n: usize) -> usize {
        n ^ 3
    }

    fn set_fccob(r: &RegisterBlock, n: usize, value: u8) {
        unsafe { r.fccob[Self::fccob_index(n)].write(value) }
    }

    /// Wait out any previous command and clear stale error flags.
    fn begin_command(r: &RegisterBlock) {
        while r.fstat.read() & FSTAT_CCIF == 0 {}
        unsafe { r.fstat.write(FSTAT_ACCERR | FSTAT_FPVIOL) };
    }

    /// Status of the most recent command.
    pub fn last_status(&self) -> ControllerStatus {
        let fstat = Self::regs().fstat.read();
        ControllerStatus {
            complete: fstat & FSTAT_CCIF != 0,
            access_error: fstat & FSTAT_ACCERR != 0,
            protection_violation: fstat & FSTAT_FPVIOL != 0,
            command_fault: fstat & FSTAT_MGSTAT0 != 0,
        }
    }

    /// Erase `sectors` consecutive sectors starting at `base`.
    pub fn erase_range(&mut self, base: u32, sectors: u32) -> Result<(), Error> {
        for i in 0..sectors {
            self.erase_sector(base + i * SECTOR_SIZE as u32)?;
        }
        Ok(())
    }
}

impl Default for Ftfc {
    fn default() -> Self {
        Self::new()
    }
}

/// Launch the loaded command and poll for completion.
///
/// Placed in RAM: a P-flash command stalls reads of the array it runs
/// against, so the launch/poll pair must not fetch from flash.
#[cfg_attr(target_os = "none", link_section = ".data")]
#[inline(never)]
fn launch_and_wait(r: &RegisterBlock) {
    unsafe { r.fstat.write(FSTAT_CCIF) };
    while r.fstat.read() & FSTAT_CCIF == 0 {}
}

impl FlashAccess for Ftfc {
    fn read_word(&self, addr: u32) -> u32 {
        unsafe { core::ptr::read_volatile(addr as *const u32) }
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Error> {
        let r = Self::regs();
        Self::begin_command(r);

        Self::set_fccob(r, 0, CMD_ERASE_SECTOR);
        Self::set_fccob(r, 1, (addr >> 16) as u8);
        Self::set_fccob(r, 2, (addr >> 8) as u8);
        Self::set_fccob(r, 3, addr as u8);

        launch_and_wait(r);
        check_fstat(r.fstat.read())
    }

    fn program_phrase(&mut self, addr: u32, data: &[u8; PHRASE_SIZE]) -> Result<(), Error> {
        let r = Self::regs();
        Self::begin_command(r);

        Self::set_fccob(r, 0, CMD_PROGRAM_PHRASE);
        Self::set_fccob(r, 1, (addr >> 16) as u8);
        Self::set_fccob(r, 2, (addr >> 8) as u8);
        Self::set_fccob(r, 3, addr as u8);
        for (i, &b) in data.iter().enumerate() {
            Self::set_fccob(r, 4 + i, b);
        }

        launch_and_wait(r);
        check_fstat(r.fstat.read())
    }
}

// ==========
// traits

impl embedded_storage::nor_flash::NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match *self {
            // The controller reports misaligned or out-of-map addresses
            // as access errors.
            Error::AccessError => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl embedded_storage::nor_flash::ErrorType for Ftfc {
    type Error = Error;
}

impl embedded_storage::nor_flash::ReadNorFlash for Ftfc {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > FLASH_SIZE {
            return Err(Error::AccessError);
        }
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = unsafe { core::ptr::read_volatile((offset as usize + i) as *const u8) };
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE
    }
}

impl embedded_storage::nor_flash::NorFlash for Ftfc {
    const WRITE_SIZE: usize = PHRASE_SIZE;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE as u32 != 0 || to % SECTOR_SIZE as u32 != 0 || from > to {
            return Err(Error::AccessError);
        }
        self.erase_range(from, (to - from) / SECTOR_SIZE as u32)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset % PHRASE_SIZE as u32 != 0 || bytes.len() % PHRASE_SIZE != 0 {
            return Err(Error::AccessError);
        }
        for (i, phrase) in bytes.chunks_exact(PHRASE_SIZE).enumerate() {
            let mut buf = [0u8; PHRASE_SIZE];
            buf.copy_from_slice(phrase);
            self.program_phrase(offset + (i * PHRASE_SIZE) as u32, &buf)?;
        }
        Ok(())
    }
}
