// Memory management with object pooling and a fixed buffer arena
pub mod arena;
pub mod pool;

pub use arena::{BufferPool, Segment};
pub use pool::{Checkable, CheckablePool, ObjectPool, Pool};
