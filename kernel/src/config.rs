//! Compile-time configuration for the memory management core.
//!
//! Environment and configuration are compile-time only: there is no on-disk
//! format, no CLI, and no runtime config file. Everything a deployment might
//! want to tune lives here as a `const`.

/// Size of a physical frame in bytes.
pub const FRAME_SIZE: usize = 4096;

/// Highest buddy order supported (order `k` holds blocks of `2^k` frames).
pub const BUDDY_MAX_ORDER: usize = 10;

/// Number of buddy zones (`UNMOVABLE`, `RECLAIMABLE`, `MOVABLE`).
pub const BUDDY_ZONE_COUNT: usize = 3;

/// Bucket count for the page-ref hash table. Must be a power of two.
pub const PAGE_REF_HASH_BUCKETS: usize = 256;

/// Bucket count for the page-cache hash table. Must be a power of two.
pub const PAGE_CACHE_HASH_BUCKETS: usize = 256;

/// Default maximum number of resident entries in the page cache.
pub const PAGE_CACHE_DEFAULT_CAPACITY: usize = 512;

/// Maximum number of concurrently tracked address spaces.
pub const MAX_ADDRESS_SPACES: usize = 256;

/// Cache-line size used for slab color rotation.
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of color offsets a slab cache rotates through before wrapping.
pub const SLAB_COLOR_MAX_STEPS: usize = 8;

/// Number of objects a per-CPU slab magazine can hold.
pub const SLAB_MAGAZINE_CAPACITY: usize = 16;

/// Logical CPU count. The reference targets a single logical processor;
/// per-CPU state (the slab magazine) degenerates to a single slot.
pub const MAX_LOGICAL_CPUS: usize = 1;

/// Size classes routed to the slab-backed fast path by the general heap.
pub const HEAP_SLAB_SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Allocations at or above this size always go to the general heap
/// (first-fit) path rather than the slab fast path.
pub const HEAP_SLAB_THRESHOLD: usize = 4096;

/// Magic word written into every live heap/slab allocation header.
pub const HEAP_ALLOC_MAGIC: u32 = 0xDEAD_BEEF;

/// Minimum payload bytes retained by a heap block split (below this the
/// leftover is left attached rather than split off as its own free block).
pub const HEAP_MIN_SPLIT_PAYLOAD: usize = 16;

/// Virtual base of the direct-map window mirroring all physical RAM.
/// Frame-zeroing, page-copying, and in-frame header access all go through
/// this window rather than touching physical addresses directly.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;
