use std::io;

/// Errors surfaced across the collaborator boundary (spec §7).
///
/// Every other condition the allocator can hit in normal operation (empty
/// lists, full superblocks, lost trylock races, retrying after a migration)
/// is ordinary control flow and never reaches this type.
#[derive(thiserror::Error, Debug)]
pub enum HoardError {
    /// The page-supply primitive failed during `init()`. No partial state is
    /// left behind; the caller gets a clean negative status.
    #[error("failed to initialize page supply: {0}")]
    Init(#[source] io::Error),

    /// An alignment was requested above what every slot in every size class
    /// (and every huge-block header) is guaranteed to land on. `GlobalAlloc`
    /// implementations must honor `Layout::align`, so this is reported
    /// rather than silently under-aligning the returned block.
    #[error("requested alignment {requested} exceeds the {max_supported}-byte alignment this allocator guarantees")]
    UnsupportedAlignment {
        requested: usize,
        max_supported: usize,
    },
}

pub type Result<T> = std::result::Result<T, HoardError>;
