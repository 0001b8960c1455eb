//! Support code for the `sable` command-line runner.

pub mod input;
pub mod listing;

pub use input::{read_input, InputError, LoadedChunk};
pub use listing::{assemble_str, ChunkKind, ChunkListing, ListingError};
