use crate::ExecError;
use std::ptr;

pub const ALIGN: usize = 8;

pub fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// A fixed-capacity bump region.
///
/// On unix the region is an anonymous private mapping that can be made
/// inaccessible with `lock`. Elsewhere it is a plain heap allocation and
/// locking is a no-op.
pub struct Arena {
    base: *mut u8,
    len: usize,
    used: usize,
    locked: bool,
}

// The region is exclusively owned and only reached through `&self`/`&mut self`.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(len: usize) -> Result<Self, ExecError> {
        let base = if len == 0 {
            ptr::null_mut()
        } else {
            map_region(len)?
        };
        Ok(Self {
            base,
            len,
            used: 0,
            locked: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.len - self.used
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Reserves `size` bytes rounded up to the alignment and returns their
    /// offset, or `None` when the region is exhausted.
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        debug_assert!(!self.locked, "bump on a locked arena");
        let size = align_up(size);
        if size > self.free() {
            return None;
        }
        let offset = self.used;
        self.used += size;
        Some(offset)
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn lock(&mut self) -> Result<(), ExecError> {
        if !self.locked {
            protect_region(self.base, self.len, false)?;
            self.locked = true;
        }
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<(), ExecError> {
        if self.locked {
            protect_region(self.base, self.len, true)?;
            self.locked = false;
        }
        Ok(())
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        unsafe { ptr::read(self.base.add(offset) as *const u64) }
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.check(offset, 8);
        unsafe { ptr::write(self.base.add(offset) as *mut u64, value) }
    }

    pub fn zero(&mut self, offset: usize, len: usize) {
        self.check(offset, len);
        if len > 0 {
            unsafe { ptr::write_bytes(self.base.add(offset), 0, len) }
        }
    }

    /// Moves `len` bytes inside this arena. The ranges may overlap.
    pub fn copy_within(&mut self, from: usize, to: usize, len: usize) {
        self.check(from, len);
        self.check(to, len);
        if len > 0 {
            unsafe { ptr::copy(self.base.add(from), self.base.add(to), len) }
        }
    }

    /// Copies `len` bytes from `source` at `from` into this arena at `to`.
    pub fn copy_from(&mut self, source: &Arena, from: usize, to: usize, len: usize) {
        source.check(from, len);
        self.check(to, len);
        if len > 0 {
            unsafe { ptr::copy_nonoverlapping(source.base.add(from), self.base.add(to), len) }
        }
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset % ALIGN == 0 && offset + len <= self.used,
            "arena access out of bounds: {}+{} (used {})",
            offset,
            len,
            self.used
        );
        debug_assert!(!self.locked, "access to a locked arena");
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unmap_region(self.base, self.len);
        }
    }
}

#[cfg(unix)]
fn map_region(len: usize) -> Result<*mut u8, ExecError> {
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(ExecError::Arena(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(base as *mut u8)
}

#[cfg(unix)]
fn protect_region(base: *mut u8, len: usize, accessible: bool) -> Result<(), ExecError> {
    if base.is_null() {
        return Ok(());
    }
    let prot = if accessible {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    let rc = unsafe { libc::mprotect(base as *mut _, len, prot) };
    if rc != 0 {
        return Err(ExecError::Arena(format!(
            "mprotect failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn unmap_region(base: *mut u8, len: usize) {
    let rc = unsafe { libc::munmap(base as *mut _, len) };
    if rc != 0 {
        tracing::warn!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn region_layout(len: usize) -> Result<std::alloc::Layout, ExecError> {
    std::alloc::Layout::from_size_align(len, ALIGN).map_err(|err| ExecError::Arena(err.to_string()))
}

#[cfg(not(unix))]
fn map_region(len: usize) -> Result<*mut u8, ExecError> {
    let layout = region_layout(len)?;
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return Err(ExecError::Arena(format!("failed to reserve {} bytes", len)));
    }
    Ok(base)
}

#[cfg(not(unix))]
fn protect_region(_base: *mut u8, _len: usize, _accessible: bool) -> Result<(), ExecError> {
    Ok(())
}

#[cfg(not(unix))]
fn unmap_region(base: *mut u8, len: usize) {
    if let Ok(layout) = region_layout(len) {
        unsafe { std::alloc::dealloc(base, layout) }
    }
}
