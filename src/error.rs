//! Error and corruption report types.

/// Errors returned at the call site of a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::Error)]
#[non_exhaustive]
pub enum HeapError {
    /// The requested alignment is not a power of two.
    #[display("alignment {alignment:#x} is not a power of two")]
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },
    /// The backing store could not provide enough memory.
    #[display("out of memory: size={size:#x} alignment={alignment:#x}")]
    OutOfMemory {
        /// The requested size.
        size: usize,
        /// The requested alignment.
        alignment: usize,
    },
}

/// The kind of damage reported through [`Backing::on_corruption`](crate::Backing::on_corruption).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum CorruptionCode {
    /// A freed pointer does not name a live allocation of this heap.
    #[display("invalid free")]
    InvalidFree,
    /// A block was freed while already free.
    #[display("double free")]
    DoubleFree,
    /// The header following a block was overwritten, detected while freeing the block.
    #[display("buffer overrun")]
    BufferOverrun,
    /// A chunk's guard, size or footer is inconsistent.
    #[display("corrupted chunk")]
    CorruptedChunk,
    /// The free-space index disagrees with the chunks in the heap.
    #[display("free space inconsistency")]
    FreeSpaceInconsistency,
    /// An extent's header, boundaries or fencepost are inconsistent.
    #[display("bad extent")]
    BadExtent,
    /// Heap-level bookkeeping is inconsistent.
    #[display("corrupt heap structures")]
    CorruptStructures,
    /// The heap was destroyed twice.
    #[display("double destroy")]
    DoubleDestroy,
}
