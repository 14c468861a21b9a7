//! Collaborator traits consumed by the engine, plus production accessors.
//!
//! The engine is generic over how registers and DMA memory are reached so the same code runs on
//! real hardware (volatile pointer access, see [`MmioWindow`] and [`DirectMappedMemory`]) and
//! against a simulated controller in tests.

use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use core::time::Duration;

/// Size of the allocation unit handed out by [`RegionAllocator`].
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes` bytes.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// A mapped, uncached register window.
///
/// Offsets are relative to the mapped base. Implementations must perform each access exactly
/// once and in program order (volatile semantics).
pub trait RegisterIo {
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u32(&mut self, offset: usize, value: u32);

    /// Reads an 8-bit field.
    ///
    /// Some controllers only decode dword accesses, so the default reads the containing aligned
    /// dword and extracts the byte.
    fn read_u8(&self, offset: usize) -> u8 {
        let dword = self.read_u32(offset & !0x3);
        (dword >> ((offset & 0x3) * 8)) as u8
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let lo = u64::from(self.read_u32(offset));
        let hi = u64::from(self.read_u32(offset + 4));
        lo | (hi << 32)
    }

    /// Writes a 64-bit register as two dwords, low half first.
    fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}

/// CPU access to device-visible memory, addressed by device (bus) address.
///
/// The implementation owns the device-to-virtual translation.
pub trait DmaMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_physical(paddr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_physical(paddr, &value.to_le_bytes());
    }

    /// Zeroes `len` bytes starting at `paddr`.
    fn fill_zero(&mut self, paddr: u64, len: usize) {
        const CHUNK: [u8; 64] = [0; 64];
        let mut off = 0usize;
        while off < len {
            let n = (len - off).min(CHUNK.len());
            self.write_physical(paddr + off as u64, &CHUNK[..n]);
            off += n;
        }
    }
}

/// Allocator for zero-initialized, page-aligned, address-stable DMA regions.
pub trait RegionAllocator {
    /// Returns the device address of `count` contiguous pages, or `None` when exhausted.
    fn allocate_pages(&mut self, count: usize) -> Option<u64>;
    fn free_pages(&mut self, paddr: u64, count: usize);
}

/// Monotonic time source used for poll deadlines.
pub trait Clock {
    fn now(&self) -> Duration;

    /// Called between two polls of a hardware condition.
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// Everything the controller owns besides its register window.
pub trait Platform: DmaMemory + RegionAllocator + Clock {}

impl<T: DmaMemory + RegionAllocator + Clock> Platform for T {}

/// MMIO mapping collaborator.
pub trait MmioMapper {
    type Window: RegisterIo;

    fn map(&mut self, phys: u64, len: usize) -> Option<Self::Window>;
    fn unmap(&mut self, window: Self::Window);
}

/// A DMA region owned by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    pub paddr: u64,
    pub pages: usize,
}

impl DmaRegion {
    pub fn allocate<A: RegionAllocator + ?Sized>(alloc: &mut A, pages: usize) -> Option<Self> {
        let paddr = alloc.allocate_pages(pages)?;
        Some(Self { paddr, pages })
    }

    pub fn size_bytes(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn free<A: RegionAllocator + ?Sized>(self, alloc: &mut A) {
        alloc.free_pages(self.paddr, self.pages);
    }
}

/// Volatile register window over a mapped MMIO range.
pub struct MmioWindow {
    base: NonNull<u8>,
    len: usize,
}

impl MmioWindow {
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes of uncached device registers that
    /// stays valid for the lifetime of the window, and nothing else may alias it.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        Some(Self {
            base: NonNull::new(base)?,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} outside mapped window"
        );
        // SAFETY: bounds and alignment checked above; the mapping contract is upheld by `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>() }
    }
}

impl RegisterIo for MmioWindow {
    fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: `reg` yields an in-bounds, aligned pointer into the mapped window.
        unsafe { core::ptr::read_volatile(self.reg(offset)) }
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        // SAFETY: `reg` yields an in-bounds, aligned pointer into the mapped window.
        unsafe { core::ptr::write_volatile(self.reg(offset), value) }
    }
}

/// Device memory reached through a constant-offset direct map (`virt = paddr + offset`).
///
/// An offset of zero is the identity mapping.
pub struct DirectMappedMemory {
    offset: usize,
}

impl DirectMappedMemory {
    /// # Safety
    ///
    /// Every device address the engine is handed by its [`RegionAllocator`] must be mapped
    /// read/write at `paddr + offset` for the lifetime of this value.
    pub unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }

    fn virt(&self, paddr: u64) -> *mut u8 {
        (paddr as usize).wrapping_add(self.offset) as *mut u8
    }
}

impl DmaMemory for DirectMappedMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let src = self.virt(paddr);
        fence(Ordering::Acquire);
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: the direct-map contract of `new` covers every allocated device address.
            *byte = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let dst = self.virt(paddr);
        for (i, byte) in buf.iter().enumerate() {
            // SAFETY: the direct-map contract of `new` covers every allocated device address.
            unsafe { core::ptr::write_volatile(dst.add(i), *byte) };
        }
        fence(Ordering::Release);
    }
}
