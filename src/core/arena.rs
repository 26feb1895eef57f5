//! Bump allocator backing every engine object
//!
//! Memory comes from large anonymous `mmap` regions ("arenas") chained
//! together. Allocation is a single bump of a counter; nothing is ever freed
//! individually. [`Arena::reset`] rewinds every arena for whole-engine resets
//! and [`Arena::destroy`] hands all memory back to the operating system.
//!
//! Each arena starts with an [`ArenaHeader`] that holds the link to the next
//! arena, so the chain itself never touches the general allocator.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};

/// Alignment of every block handed out by the arena
pub const ARENA_ALIGN: usize = 16;

/// Size of a freshly mapped arena unless a request needs more
pub const DEFAULT_ARENA_SIZE: usize = 1 << 20;

#[repr(C)]
struct ArenaHeader {
    next: Option<NonNull<ArenaHeader>>,
    size: usize,
    used: usize,
}

const HEADER_SIZE: usize = align_up(mem::size_of::<ArenaHeader>(), ARENA_ALIGN);

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Chain of mapped arenas with bump allocation
pub struct Arena {
    head: Option<NonNull<ArenaHeader>>,
    default_size: usize,
    page_size: usize,
}

// SAFETY: the arena exclusively owns its mappings; the raw pointers are never
// shared outside of `&mut self` access.
unsafe impl Send for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Create an empty arena chain using [`DEFAULT_ARENA_SIZE`]
    pub fn new() -> Self {
        Self::with_arena_size(DEFAULT_ARENA_SIZE)
    }

    /// Create an empty arena chain whose arenas are at least `size` bytes
    ///
    /// No memory is mapped until the first allocation.
    pub fn with_arena_size(size: usize) -> Self {
        let page_size = page_size();
        Arena {
            head: None,
            default_size: align_up(size.max(HEADER_SIZE + ARENA_ALIGN), page_size),
            page_size,
        }
    }

    /// Carve `size` bytes out of the arena chain
    ///
    /// The size is rounded up to [`ARENA_ALIGN`]. Arenas are searched from the
    /// most recently mapped one; if none has room a new arena of
    /// `max(default size, size rounded to the page size)` is mapped and
    /// prepended to the chain.
    ///
    /// # Returns
    /// `None` only if mapping a new arena failed
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size.max(1), ARENA_ALIGN);

        let mut cursor = self.head;
        while let Some(arena) = cursor {
            // SAFETY: every header in the chain points at a live mapping we own.
            let header = unsafe { &mut *arena.as_ptr() };
            if let Some(block) = Self::bump(arena, header, size) {
                return Some(block);
            }
            cursor = header.next;
        }

        let arena = self.map_arena(size)?;
        // SAFETY: just mapped and initialised by `map_arena`.
        let header = unsafe { &mut *arena.as_ptr() };
        Self::bump(arena, header, size)
    }

    fn bump(arena: NonNull<ArenaHeader>, header: &mut ArenaHeader, size: usize) -> Option<NonNull<u8>> {
        if header.size - header.used < size {
            return None;
        }
        // SAFETY: `used + size <= size of the mapping`, so the block is in bounds.
        let block = unsafe { arena.as_ptr().cast::<u8>().add(header.used) };
        header.used += size;
        NonNull::new(block)
    }

    fn map_arena(&mut self, size: usize) -> Option<NonNull<ArenaHeader>> {
        let wanted = align_up(size.checked_add(HEADER_SIZE)?, self.page_size);
        let len = self.default_size.max(wanted);

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }

        let header = NonNull::new(raw.cast::<ArenaHeader>())?;
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long.
        unsafe {
            header.as_ptr().write(ArenaHeader {
                next: self.head,
                size: len,
                used: HEADER_SIZE,
            });
        }
        self.head = Some(header);
        Some(header)
    }

    /// Move `value` into arena memory
    ///
    /// Falls back to the global allocator when no arena can be mapped. If that
    /// fails too the process aborts: the engine has no way to continue
    /// without corrupting its graph.
    pub(crate) fn alloc<T>(&mut self, value: T) -> NonNull<T> {
        const { assert!(mem::align_of::<T>() <= ARENA_ALIGN) };
        let layout = Layout::new::<T>();

        let block = match self.allocate(layout.size()) {
            Some(block) => block.cast::<T>(),
            None => {
                // SAFETY: engine object types are never zero sized.
                let raw = unsafe { alloc::alloc(layout) };
                match NonNull::new(raw) {
                    Some(block) => block.cast::<T>(),
                    None => {
                        eprintln!("[LOCKDEP] FATAL: engine memory exhausted");
                        alloc::handle_alloc_error(layout)
                    }
                }
            }
        };
        // SAFETY: the block is fresh, large enough and suitably aligned.
        unsafe { block.as_ptr().write(value) };
        block
    }

    /// Rewind every arena to empty
    ///
    /// All previously returned pointers become dangling. Memory stays mapped.
    pub fn reset(&mut self) {
        let mut cursor = self.head;
        while let Some(arena) = cursor {
            // SAFETY: live mapping owned by this chain.
            let header = unsafe { &mut *arena.as_ptr() };
            header.used = HEADER_SIZE;
            cursor = header.next;
        }
    }

    /// Unmap every arena and clear the chain
    pub fn destroy(&mut self) {
        let mut cursor = self.head.take();
        while let Some(arena) = cursor {
            // SAFETY: read the header before the mapping disappears.
            let (next, size) = unsafe {
                let header = &*arena.as_ptr();
                (header.next, header.size)
            };
            // SAFETY: `arena` is the start of a mapping of exactly `size` bytes.
            let rc = unsafe { libc::munmap(arena.as_ptr().cast(), size) };
            if rc != 0 {
                eprintln!(
                    "[LOCKDEP] munmap failed for arena: {}",
                    std::io::Error::last_os_error()
                );
            }
            cursor = next;
        }
    }

    /// Number of arenas currently mapped
    pub fn arena_count(&self) -> usize {
        self.headers().count()
    }

    /// Bytes handed out since the last reset, header space excluded
    pub fn bytes_used(&self) -> usize {
        self.headers().map(|(_, used)| used - HEADER_SIZE).sum()
    }

    /// Total bytes mapped
    pub fn bytes_mapped(&self) -> usize {
        self.headers().map(|(size, _)| size).sum()
    }

    fn headers(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let arena = cursor?;
            // SAFETY: live mapping owned by this chain.
            let header = unsafe { &*arena.as_ptr() };
            cursor = header.next;
            Some((header.size, header.used))
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.destroy();
    }
}
