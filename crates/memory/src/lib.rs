pub mod cache;
pub mod embedding;
pub mod keyword;
pub mod lore;
pub mod manager;
pub mod schema;
pub mod vector;

pub use cache::{CacheStats, ResponseCache, cache_key};
pub use embedding::{DisabledEmbedder, Embedder, EmbeddingError};
pub use keyword::KeywordIndex;
pub use manager::{MemoryManager, MemoryStats};
pub use schema::{Chunk, Episode, KeywordSearch, SearchHit, truncate_for_display, truncate_str};
pub use vector::VectorIndex;
