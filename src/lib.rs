pub mod completion;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch_task;
pub mod image_loader;
pub mod memory_cache;
pub mod pipeline;
pub mod resource;

pub use completion::{Completion, CompletionContext, CompletionQueue};
pub use config::{DiskTierConfig, PipelineConfig, RuntimeToggles};
pub use error::{Error, ErrorKind, Result};
pub use executor::{ExecutorConfig, WorkQueueExecutor};
pub use fetch_task::{FetchEnv, FetchResult, FetchStatus, FetchTask, Tier};
pub use image_loader::{
  compute_sample_factor, BitmapDecoder, DecodeLimits, DecodedImage, SampledDecoder, TargetBox,
};
pub use memory_cache::{MemoryCache, MemoryKey};
pub use pipeline::{FetchRequest, MemoryTierCoordinator};

// Re-export the resource layer's common types
pub use resource::{
  CacheKey, DiskCache, DiskCacheConfig, HttpConfig, HttpRequest, HttpResponse, HttpSession,
  ResourceBundle, ResourceFetcher, ResourceTable, Source,
};
