/// Constants shared across the cache storage workspace

// Entry stream layout
pub const INDEX_HEADERS: usize = 0;
pub const INDEX_RESPONSE_BODY: usize = 1;
pub const INDEX_SIDE_DATA: usize = 2;
pub const ENTRY_STREAM_COUNT: usize = 3;

// Upper bound on the estimated serialized size of one query's results (10 MiB)
pub const MAX_QUERY_RESULT_BYTES: u64 = 10 * 1024 * 1024;

// Chunk size used when streaming blob data into an entry (64 KiB)
pub const DEFAULT_BODY_CHUNK_SIZE: usize = 64 * 1024;

// Per-origin index record
pub const INDEX_FILE_NAME: &str = "index.bin";
pub const INDEX_VERSION: u32 = 1;

// Default per-origin quota (1 GiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;
