pub mod block;
pub mod error;

pub use block::{Block, ClusterTopic, BLOCK_MAGIC, MAX_BLOCK_SIZE};
pub use error::{Error, Result};
