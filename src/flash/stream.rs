//! Phrase-coalescing flash write streamer.
//!
//! S-record data need not arrive aligned or ordered within a phrase, but
//! the controller programs whole 8-byte phrases and forbids reprogramming
//! a phrase that was not erased in between. The streamer buffers one
//! aligned phrase at a time, flushes when the write cursor leaves it, and
//! skips the program entirely when flash already holds the buffered image.

use super::{Error as FlashError, FlashAccess, PHRASE_SIZE};

const PHRASE_MASK: u32 = PHRASE_SIZE as u32 - 1;

/// Streamer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Empty input.
    Param,
    /// Write window leaves the permitted address range.
    Range,
    /// The controller rejected a phrase program.
    Flash(FlashError),
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

/// One-phrase write-combining cache over a [`FlashAccess`] device.
///
/// Writes outside `[start, end)` are rejected before any device access.
pub struct FlashStream {
    start: u32,
    end: u32,
    base: u32,
    image: [u8; PHRASE_SIZE],
    valid: bool,
    dirty: bool,
}

impl FlashStream {
    /// New streamer accepting writes within `[start, end)`.
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            base: 0,
            image: [0xFF; PHRASE_SIZE],
            valid: false,
            dirty: false,
        }
    }

    /// Drop any cached phrase without programming it.
    pub fn reset(&mut self) {
        self.base = 0;
        self.image = [0xFF; PHRASE_SIZE];
        self.valid = false;
        self.dirty = false;
    }

    /// Stream `data` into flash at `addr`.
    ///
    /// Bytes accumulate in the cached phrase; crossing into a different
    /// phrase flushes the previous one first. Nothing is programmed for
    /// the trailing phrase until [`finish`](Self::finish).
    pub fn write<F: FlashAccess>(
        &mut self,
        flash: &mut F,
        addr: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::Param);
        }
        let end = match addr.checked_add(data.len() as u32) {
            Some(end) => end,
            None => return Err(Error::Range),
        };
        if addr < self.start || end > self.end {
            return Err(Error::Range);
        }

        for (i, &b) in data.iter().enumerate() {
            self.push_byte(flash, addr + i as u32, b)?;
        }
        Ok(())
    }

    fn push_byte<F: FlashAccess>(&mut self, flash: &mut F, addr: u32, b: u8) -> Result<(), Error> {
        let base = addr & !PHRASE_MASK;

        if self.valid && base != self.base {
            self.flush(flash)?;
            self.valid = false;
        }
        if !self.valid {
            self.base = base;
            self.image = [0xFF; PHRASE_SIZE];
            self.valid = true;
            self.dirty = false;
        }

        self.image[(addr & PHRASE_MASK) as usize] = b;
        self.dirty = true;
        Ok(())
    }

    /// Program the cached phrase if it is dirty and differs from flash.
    pub fn flush<F: FlashAccess>(&mut self, flash: &mut F) -> Result<(), Error> {
        if !self.valid || !self.dirty {
            return Ok(());
        }

        let mut current = [0u8; PHRASE_SIZE];
        current[..4].copy_from_slice(&flash.read_word(self.base).to_le_bytes());
        current[4..].copy_from_slice(&flash.read_word(self.base + 4).to_le_bytes());
        if current == self.image {
            // Already holds the image; programming again would only add
            // wear and trip the no-reprogram rule.
            self.dirty = false;
            return Ok(());
        }

        flash.program_phrase(self.base, &self.image)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush the trailing phrase and clear the cache.
    pub fn finish<F: FlashAccess>(&mut self, flash: &mut F) -> Result<(), Error> {
        let result = self.flush(flash);
        self.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::mock::MockFlash;

    fn stream() -> FlashStream {
        FlashStream::new(0x0000, 0x1_0000)
    }

    #[test]
    fn coalesces_one_program_per_touched_phrase() {
        let mut flash = MockFlash::new(0, 0x1000);
        let mut s = stream();

        // 20 bytes from 0x0 touch bases 0x0, 0x8 and 0x10.
        let data: [u8; 20] = core::array::from_fn(|i| i as u8 + 1);
        s.write(&mut flash, 0x0, &data[..4]).unwrap();
        s.write(&mut flash, 0x4, &data[4..12]).unwrap();
        s.write(&mut flash, 0xC, &data[12..]).unwrap();
        s.finish(&mut flash).unwrap();

        assert_eq!(flash.programs, 3);
        assert_eq!(flash.program_bases, [0x0, 0x8, 0x10]);
        assert_eq!(flash.bytes(0, 20), &data[..]);
    }

    #[test]
    fn sub_phrase_writes_merge_into_one_program() {
        let mut flash = MockFlash::new(0xA000, 0x1000);
        let mut s = FlashStream::new(0xA000, 0xB000);

        s.write(&mut flash, 0xA000, &[1, 2, 3, 4]).unwrap();
        s.write(&mut flash, 0xA004, &[5, 6, 7, 8]).unwrap();
        assert_eq!(flash.programs, 0);

        s.finish(&mut flash).unwrap();
        assert_eq!(flash.programs, 1);
        assert_eq!(flash.program_bases, [0xA000]);
        assert_eq!(flash.bytes(0xA000, 8), [1u8, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn identical_content_skips_the_program() {
        let mut flash = MockFlash::new(0, 0x1000);
        flash.preload(0x10, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x11, 0x22, 0x33]);
        let mut s = stream();

        s.write(&mut flash, 0x10, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x11, 0x22, 0x33])
            .unwrap();
        s.finish(&mut flash).unwrap();

        assert_eq!(flash.programs, 0);
    }

    #[test]
    fn rejects_writes_outside_the_window() {
        let mut flash = MockFlash::new(0, 0x1000);
        let mut s = FlashStream::new(0xA000, 0xB000);

        assert_eq!(s.write(&mut flash, 0x9FFF, &[0; 4]), Err(Error::Range));
        assert_eq!(s.write(&mut flash, 0xAFFE, &[0; 4]), Err(Error::Range));
        assert_eq!(s.write(&mut flash, 0xFFFF_FFFC, &[0; 8]), Err(Error::Range));
        assert_eq!(flash.programs, 0);
        assert_eq!(flash.erases, 0);
        assert_eq!(flash.reads.get(), 0);
    }

    #[test]
    fn rejects_empty_input() {
        let mut flash = MockFlash::new(0, 0x1000);
        let mut s = stream();
        assert_eq!(s.write(&mut flash, 0x0, &[]), Err(Error::Param));
    }

    #[test]
    fn base_change_flushes_the_previous_phrase() {
        let mut flash = MockFlash::new(0, 0x1000);
        let mut s = stream();

        s.write(&mut flash, 0x0, &[9; 2]).unwrap();
        assert_eq!(flash.programs, 0);
        s.write(&mut flash, 0x8, &[7; 1]).unwrap();
        assert_eq!(flash.programs, 1);
        assert_eq!(flash.program_bases, [0x0]);
        // Untouched lanes of the flushed phrase stay erased.
        assert_eq!(flash.bytes(0, 8), [9u8, 9, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn controller_error_is_surfaced() {
        let mut flash = MockFlash::new(0, 0x1000);
        flash.fail_program = true;
        let mut s = stream();

        s.write(&mut flash, 0x0, &[1, 2, 3]).unwrap();
        assert_eq!(
            s.finish(&mut flash),
            Err(Error::Flash(FlashError::CommandFault))
        );
    }

    #[test]
    fn flush_of_a_clean_cache_is_a_no_op() {
        let mut flash = MockFlash::new(0, 0x1000);
        let mut s = stream();

        s.flush(&mut flash).unwrap();
        s.write(&mut flash, 0x20, &[4; 4]).unwrap();
        s.flush(&mut flash).unwrap();
        s.flush(&mut flash).unwrap();
        assert_eq!(flash.programs, 1);
    }
}
