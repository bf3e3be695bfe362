//! The direct physical-memory mapping shared by every processor.

/// PML4 slot the physical-memory window is mapped at.
pub const HOST_PHYSICAL_MEMORY_PML4_IDX: usize = 255;

/// Linear address physical address zero is mapped at.
pub const HOST_PHYSICAL_MEMORY_BASE: usize = HOST_PHYSICAL_MEMORY_PML4_IDX << 39;

/// Amount of physical memory covered by the window.
pub const HOST_PHYSICAL_MEMORY_SIZE: usize = 128 << 30;

/// The session-wide window.
pub const HOST_PHYSICAL_MEMORY: PhysMemWindow =
    PhysMemWindow::new(HOST_PHYSICAL_MEMORY_BASE, HOST_PHYSICAL_MEMORY_SIZE);

/// A fixed linear range mapping physical memory `0..size` at `base`.
///
/// The window is set up once by the address-translation subsystem and never
/// changes afterwards; processors access it without synchronization and keep
/// their writes to disjoint physical ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMemWindow {
    base: usize,
    size: usize,
}

impl PhysMemWindow {
    /// Creates a window mapping `size` bytes of physical memory at `base`.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Linear address of physical address zero.
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Bytes of physical memory covered.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the linear address of `[paddr, paddr + len)`, or `None` when
    /// any part of the range falls outside the window.
    pub fn translate(&self, paddr: u64, len: usize) -> Option<usize> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        if end > self.size {
            return None;
        }
        Some(self.base + start)
    }
}
