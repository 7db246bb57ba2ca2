//! Executable memory backing installed code.
//!
//! Each code cache entry is copied into its own mapping, which is sealed
//! read+execute before any header referencing it is published. After that
//! the mapping is immutable and can be shared freely between threads.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("could not map {0} bytes for code")]
    MapFailed(usize),
    #[error("could not seal code mapping at {0:#x}")]
    SealFailed(usize),
    #[error("code image of {0} bytes is not installable")]
    InvalidSize(usize),
}

/// One sealed code image. The bytes never change after construction.
pub struct ExecutableMemory {
    base: NonNull<u8>,
    mapped_len: usize,
    image_len: usize,
}

#[cfg(unix)]
fn granule() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 { page as usize } else { 4096 }
}

#[cfg(not(unix))]
fn granule() -> usize {
    4096
}

impl ExecutableMemory {
    /// Map fresh pages, copy `image` in and seal them.
    pub fn from_image(image: &[u8]) -> Result<Self, MemoryError> {
        if image.is_empty() {
            return Err(MemoryError::InvalidSize(0));
        }
        let granule = granule();
        let mapped_len = image
            .len()
            .checked_next_multiple_of(granule)
            .ok_or(MemoryError::InvalidSize(image.len()))?;

        let base = map_writable(mapped_len)?;
        let memory = Self {
            base,
            mapped_len,
            image_len: image.len(),
        };
        // SAFETY: the fresh mapping is writable and at least image.len() long.
        unsafe {
            std::ptr::copy_nonoverlapping(image.as_ptr(), memory.base.as_ptr(), image.len());
        }
        seal(memory.base, mapped_len)?;
        Ok(memory)
    }

    /// Address of the first byte of the image.
    pub fn base_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Length of the copied image, excluding page padding.
    pub fn len(&self) -> usize {
        self.image_len
    }

    pub fn is_empty(&self) -> bool {
        self.image_len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the image bytes stay mapped and readable until drop.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.image_len) }
    }
}

#[cfg(unix)]
fn map_writable(len: usize) -> Result<NonNull<u8>, MemoryError> {
    // SAFETY: anonymous private mapping, no fd, kernel chooses the address.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(MemoryError::MapFailed(len));
    }
    NonNull::new(addr.cast::<u8>()).ok_or(MemoryError::MapFailed(len))
}

#[cfg(unix)]
fn seal(base: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    // SAFETY: `base..base+len` is a mapping we own.
    let rc = unsafe {
        libc::mprotect(
            base.as_ptr().cast::<libc::c_void>(),
            len,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(MemoryError::SealFailed(base.as_ptr() as usize))
    }
}

#[cfg(not(unix))]
fn map_writable(len: usize) -> Result<NonNull<u8>, MemoryError> {
    let layout = std::alloc::Layout::from_size_align(len, granule())
        .map_err(|_| MemoryError::InvalidSize(len))?;
    // SAFETY: layout has a non-zero size.
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or(MemoryError::MapFailed(len))
}

#[cfg(not(unix))]
fn seal(_base: NonNull<u8>, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: unmapping exactly the region mapped in from_image.
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.mapped_len);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.mapped_len, granule()) {
            // SAFETY: allocated with this layout in map_writable.
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutableMemory({:#x}, {} bytes)",
            self.base_address(),
            self.image_len
        )
    }
}

// Sealed mappings are immutable and exclusively owned.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
