use std::ptr;

use crate::descriptor::Segment;
use crate::Error;

const NXTDESC: isize = 0x0 / 4;
const NXTDESC_MSB: isize = 0x4 / 4;
const BUFFER_ADDRESS: isize = 0x8 / 4;
const BUFFER_ADDRESS_MSB: isize = 0xC / 4;
const CONTROL: isize = 0x18 / 4;
const STATUS: isize = 0x1C / 4;

// Descriptors are aligned to 16 words, even though only 8 or 8+5 words are used
pub const SG_DESCRIPTOR_LEN: usize = 16 * 4;

/// Largest length the 26 bit buffer length field can hold.
pub const SG_MAX_LENGTH: usize = 0x3ff_ffff;

/// View of one AXI DMA scatter-gather descriptor in DMA memory.
#[derive(Debug)]
pub struct SgDescriptor {
    base: *mut u32,
    phys: usize,
}

// Write access to the SgDescriptor requries a mutable reference, so it can even
// be Sync.
unsafe impl Send for SgDescriptor {}
unsafe impl Sync for SgDescriptor {}

impl SgDescriptor {
    /// # Safety
    ///
    /// `base` must point to `SG_DESCRIPTOR_LEN` bytes of DMA memory whose
    /// device address is `phys`, valid for the lifetime of the descriptor.
    pub unsafe fn from_base_ptr(base: *mut u32, phys_addr: usize) -> SgDescriptor {
        SgDescriptor {
            base,
            phys: phys_addr,
        }
    }

    pub fn phys_addr(&self) -> usize {
        self.phys
    }

    // About volatile accesses:
    //
    // Writes to the descriptor only have to be visible when the DMA fetches
    // it, which is ordered by the dmb() before the tail pointer write, so they
    // can be non-volatile. The DMA writes STATUS, so every read of that field
    // is volatile.

    pub fn next_descriptor(&self) -> usize {
        unsafe {
            let lsbs = ptr::read(self.base.offset(NXTDESC)) as usize;
            if cfg!(target_pointer_width = "64") {
                let msbs = ptr::read(self.base.offset(NXTDESC_MSB)) as usize;
                (msbs << 32) | lsbs
            } else {
                lsbs
            }
        }
    }

    pub fn set_next_descriptor(&mut self, addr: usize) {
        assert_eq!(addr & 0x3f, 0); // descriptors must be 16-word aligned
        unsafe {
            ptr::write(self.base.offset(NXTDESC), (addr & 0xffff_ffff) as u32);
            ptr::write(self.base.offset(NXTDESC_MSB), hi32(addr as u64));
        }
    }

    pub fn buffer_address(&self) -> usize {
        unsafe {
            let lsbs = ptr::read(self.base.offset(BUFFER_ADDRESS)) as usize;
            if cfg!(target_pointer_width = "64") {
                let msbs = ptr::read(self.base.offset(BUFFER_ADDRESS_MSB)) as usize;
                (msbs << 32) | lsbs
            } else {
                lsbs
            }
        }
    }

    pub fn set_buffer_address(&mut self, addr: u64) {
        unsafe {
            ptr::write(self.base.offset(BUFFER_ADDRESS), (addr & 0xffff_ffff) as u32);
            ptr::write(self.base.offset(BUFFER_ADDRESS_MSB), hi32(addr));
        }
    }

    pub fn buffer_length(&self) -> u32 {
        unsafe { ptr::read(self.base.offset(CONTROL)) & 0x3ffffff }
    }

    pub fn set_control(&mut self, length: u32, sof: bool, eof: bool) {
        let ctrl = (length & 0x3ffffff) | (u32::from(eof) << 26) | (u32::from(sof) << 27);
        unsafe {
            ptr::write(self.base.offset(CONTROL), ctrl);
        }
    }

    pub fn eof(&self) -> bool {
        unsafe { ptr::read(self.base.offset(CONTROL)) & (1 << 26) != 0 }
    }

    pub fn sof(&self) -> bool {
        unsafe { ptr::read(self.base.offset(CONTROL)) & (1 << 27) != 0 }
    }

    /// Fills the descriptor from `segment`, linking it to `next`.
    pub fn write_segment(&mut self, segment: &Segment, next: usize) -> Result<(), Error> {
        let len = u32::try_from(segment.len)
            .ok()
            .filter(|&l| l as usize <= SG_MAX_LENGTH)
            .ok_or_else(|| {
                Error::DescriptorBuildFailed(format!("segment of {:#x} bytes too long", segment.len))
            })?;
        self.set_next_descriptor(next);
        self.set_buffer_address(segment.dma_addr);
        self.set_control(len, segment.sof, segment.eof);
        self.clear_status();
        Ok(())
    }

    pub fn status(&self) -> u32 {
        unsafe { ptr::read_volatile(self.base.offset(STATUS)) }
    }

    pub fn transferred_bytes(&self) -> u32 {
        self.status() & 0x3ffffff
    }

    /// Internal, slave or decode error bits of the status word.
    pub fn errors(&self) -> u32 {
        self.status() & (0x7 << 28)
    }

    pub fn completed(&self) -> bool {
        self.status() & (1 << 31) != 0
    }

    pub fn clear_status(&mut self) {
        unsafe {
            ptr::write(self.base.offset(STATUS), 0);
        }
    }
}

pub(crate) fn hi32(addr: u64) -> u32 {
    (addr & !0xffff_ffff).wrapping_shr(32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Slot([u32; 16]);

    #[test]
    fn segment_encoding() {
        let mut slot = Slot([0; 16]);
        let mut d = unsafe { SgDescriptor::from_base_ptr(slot.0.as_mut_ptr(), 0x1000) };
        let seg = Segment {
            dma_addr: 0x1_2345_6780,
            len: 0x800,
            sof: true,
            eof: false,
        };
        d.write_segment(&seg, 0x1040).unwrap();
        assert_eq!(d.buffer_length(), 0x800);
        assert!(d.sof());
        assert!(!d.eof());
        assert_eq!(slot.0[2], 0x2345_6780);
        assert_eq!(slot.0[3], 0x1);
        assert_eq!(slot.0[0], 0x1040);
        assert!(!d.completed());
    }

    #[test]
    fn completion_bits() {
        let mut slot = Slot([0; 16]);
        let base = slot.0.as_mut_ptr();
        let d = unsafe { SgDescriptor::from_base_ptr(base, 0) };
        // what the DMA writes back on completion
        unsafe { base.add(7).write((1 << 31) | (1 << 29) | 0x40) };
        assert!(d.completed());
        assert_eq!(d.errors(), 1 << 29);
        assert_eq!(d.transferred_bytes(), 0x40);
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut slot = Slot([0; 16]);
        let mut d = unsafe { SgDescriptor::from_base_ptr(slot.0.as_mut_ptr(), 0) };
        let seg = Segment {
            dma_addr: 0,
            len: SG_MAX_LENGTH + 1,
            sof: true,
            eof: true,
        };
        assert!(matches!(
            d.write_segment(&seg, 0x40),
            Err(Error::DescriptorBuildFailed(_))
        ));
    }
}
