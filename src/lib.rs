//! `ext-file-sort` is a file based external merge sort implementation.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. The input is first split into chunks that each
//! fit in RAM; every chunk is sorted and stored in a temporary file. The chunk files are then merged in rounds,
//! at most `max_files_per_merge` files at a time, until a single sorted file remains, which is atomically moved to
//! the output path. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-file-sort` supports the following features:
//!
//! * **Data agnostic:**
//!   it supports all data types that implement `serde` serialization/deserialization by default,
//!   otherwise you can implement your own [`Codec`]. Line based text and fixed-width binary records are
//!   supported out of the box.
//! * **Bounded resources:**
//!   at most `max_items_per_chunk` records are held in memory and at most `max_files_per_merge + 1` files are open
//!   during a merge. Chunk files are deleted as soon as they are fully merged.
//! * **Atomic output:**
//!   the output file is replaced only once the whole input is sorted; on failure it is left untouched and every
//!   temporary file is removed.
//! * **Multithreading support:**
//!   chunks can optionally be sorted in memory by a dedicated thread pool.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use ext_file_sort::{ExternalSorter, ExternalSorterBuilder, LinesCodec};
//!
//! fn main() {
//!     let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new()
//!         .with_max_items_per_chunk(1_000_000)
//!         .with_max_files_per_merge(64)
//!         .with_progress_log()
//!         .build()
//!         .unwrap();
//!
//!     sorter
//!         .sort_file(path::Path::new("input.txt"), path::Path::new("output.txt"))
//!         .unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod merger;
pub mod progress;
pub mod sort;
pub mod tmp;

pub use buffer::{LimitedBuffer, LimitedBufferBuilder};
pub use chunk::{ChunkReader, ChunkWriter, ExternalChunk};
pub use codec::{Codec, FixedSizeCodec, LinesCodec, RecordReader, RmpCodec};
pub use merger::BinaryHeapMerger;
pub use progress::{log_progress, ProgressSink, SortEvent};
pub use sort::{CodecSortError, ExternalSorter, ExternalSorterBuilder, SortError, SortStats};
