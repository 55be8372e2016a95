use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::prelude::*;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::config::parse_size;
use crate::engine::align_up;
use crate::engine::page_size;
use crate::Direction;
use crate::DmaMemory;
use crate::DmaRegion;
use crate::Error;

/// DMA memory provided by a u-dma-buf device.
///
/// The whole u-dma-buf is mapped once; coherent allocations are carved from
/// it first-fit, and user registrations must lie inside the mapping.
pub struct UdmaBuf {
    name: String,
    size: usize,
    phys_addr: usize,
    buffer: *mut libc::c_void,
    sync_mode: bool,
    debug_vma: bool,
    sync_for_cpu: Mutex<File>,
    sync_for_device: Mutex<File>,
    // Sorted, non-overlapping (offset, len) ranges handed out.
    used: Mutex<Vec<(usize, usize)>>,
    page_size: usize,
}

impl fmt::Debug for UdmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UdmaBuf ({})", &self.name)?;
        writeln!(f, "  size: {:#x?}", &self.size)?;
        writeln!(f, "  phys_addr: {:#x?}", &self.phys_addr)?;
        writeln!(f, "  buffer: {:?}", &self.buffer)?;
        writeln!(f, "  sync_mode: {:?}", &self.sync_mode)?;
        write!(f, "  debug_vma: {:?}", &self.debug_vma)
    }
}

fn read_attr(name: &str, attr: &str) -> Result<String, Error> {
    let mut f = File::open(format!("/sys/class/u-dma-buf/{}/{}", name, attr))?;
    let mut buff = String::new();
    f.read_to_string(&mut buff)?;
    Ok(buff.trim().to_string())
}

impl UdmaBuf {
    pub fn new(name: &str) -> Result<UdmaBuf, Error> {
        let phys = read_attr(name, "phys_addr")?;
        let phys_addr = usize::from_str_radix(phys.trim_start_matches("0x"), 16)?;
        let size = parse_size(&read_attr(name, "size")?)?;
        let debug_vma = read_attr(name, "debug_vma")? != "0";
        let sync_mode = read_attr(name, "sync_mode")? != "0";

        let mut sync_open_options = OpenOptions::new();
        sync_open_options.write(true);
        let sync_for_cpu =
            sync_open_options.open(format!("/sys/class/u-dma-buf/{}/sync_for_cpu", name))?;
        let sync_for_device =
            sync_open_options.open(format!("/sys/class/u-dma-buf/{}/sync_for_device", name))?;

        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/{}", name))?;

        let buffer;
        unsafe {
            buffer = libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                dev.as_raw_fd(),
                0,
            );
            if buffer == libc::MAP_FAILED {
                return Err(Error::Mmap);
            }
        }
        log::debug!("mapped u-dma-buf {} ({:#x} bytes at phys {:#x})", name, size, phys_addr);

        Ok(UdmaBuf {
            name: name.to_string(),
            size,
            phys_addr,
            buffer,
            sync_mode,
            debug_vma,
            sync_for_cpu: Mutex::new(sync_for_cpu),
            sync_for_device: Mutex::new(sync_for_device),
            used: Mutex::new(Vec::new()),
            page_size: page_size(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn phys_addr(&self) -> usize {
        self.phys_addr
    }

    pub fn buffer(&self) -> *mut libc::c_void {
        self.buffer
    }

    pub fn sync_mode(&self) -> bool {
        self.sync_mode
    }

    pub fn debug_vma(&self) -> bool {
        self.debug_vma
    }

    fn region(&self, offset: usize, len: usize) -> Result<DmaRegion, Error> {
        let cpu = NonNull::new(unsafe { (self.buffer as *mut u8).add(offset) }).ok_or(Error::Mmap)?;
        Ok(unsafe { DmaRegion::new(cpu, (self.phys_addr + offset) as u64, len) })
    }

    fn offset_of(&self, region: &DmaRegion) -> usize {
        region.cpu_ptr() as usize - self.buffer as usize
    }

    fn release(&self, offset: usize) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.retain(|&(o, _)| o != offset);
    }
}

/// First offset in `0..size` where `len` bytes fit between the ranges of
/// `used`, which must be sorted.
fn first_fit(used: &[(usize, usize)], size: usize, len: usize, align: usize) -> Option<usize> {
    let mut candidate = 0usize;
    for &(offset, used_len) in used {
        if candidate.checked_add(len)? <= offset {
            return Some(candidate);
        }
        candidate = align_up(offset.checked_add(used_len)?, align)?;
    }
    (candidate.checked_add(len)? <= size).then_some(candidate)
}

impl DmaMemory for UdmaBuf {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, Error> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = first_fit(&used, self.size, len, self.page_size).ok_or(Error::NoMemory)?;
        let region = self.region(offset, len)?;
        let pos = used.partition_point(|&(o, _)| o < offset);
        used.insert(pos, (offset, len));
        region.bytes().fill(0);
        Ok(region)
    }

    fn free_coherent(&self, region: DmaRegion) {
        self.release(self.offset_of(&region));
    }

    fn map_user(&self, addr: usize, len: usize, _direction: Direction) -> Result<DmaRegion, Error> {
        let start = self.buffer as usize;
        let end = addr.checked_add(len).ok_or(Error::InvalidAddress { addr, len })?;
        if addr < start || end > start + self.size {
            return Err(Error::InvalidAddress { addr, len });
        }
        let offset = addr - start;
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if used.iter().any(|&(o, l)| o < offset + len && offset < o + l) {
            return Err(Error::AlreadyMapped { addr, len });
        }
        let region = self.region(offset, len)?;
        let pos = used.partition_point(|&(o, _)| o < offset);
        used.insert(pos, (offset, len));
        Ok(region)
    }

    fn unmap_user(&self, region: DmaRegion) {
        self.release(self.offset_of(&region));
    }

    fn sync_for_device(&self, _region: &DmaRegion, _offset: usize, _len: usize) -> Result<(), Error> {
        let mut f = self.sync_for_device.lock().unwrap_or_else(PoisonError::into_inner);
        f.write_all(b"1")?;
        Ok(())
    }

    fn sync_for_cpu(&self, _region: &DmaRegion, _offset: usize, _len: usize) -> Result<(), Error> {
        let mut f = self.sync_for_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        f.write_all(b"1")?;
        Ok(())
    }
}

impl Drop for UdmaBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer, self.size);
        }
    }
}

unsafe impl Send for UdmaBuf {}
unsafe impl Sync for UdmaBuf {}
