mod assembler;
mod backend;
mod layout;
mod map;

pub use assembler::{PieceAssembler, Status};
pub use backend::{Backend, FileBackend, MemoryBackend};
pub use layout::{FileLayout, Span};
pub use map::StorageMap;
