//! Sorting progress events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log;

/// Progress event emitted at every sorting phase boundary and around every merge group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortEvent {
    /// Sorting started, the input is about to be read.
    Started,
    /// A chunk of records has been sorted in memory and is being written to a temporary file.
    ChunkSorted { chunk: usize, records: usize },
    /// The input has been split into sorted chunks.
    SplitCompleted { chunks: usize, records: u64 },
    /// A merge round over `files` files split into `groups` groups started.
    MergeRoundStarted { round: usize, files: usize, groups: usize },
    /// Merging of a group of `files` files started.
    MergeGroupStarted { round: usize, group: usize, files: usize },
    /// Merging of a group completed.
    MergeGroupCompleted { round: usize, group: usize, records: u64 },
    /// The sorted result is being moved to the output path.
    Finalizing,
    /// Sorting completed.
    Completed { elapsed: Duration },
}

impl fmt::Display for SortEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortEvent::Started => write!(f, "starting sort"),
            SortEvent::ChunkSorted { chunk, records } => write!(f, "sorted {} records of chunk {}", records, chunk),
            SortEvent::SplitCompleted { chunks, records } => write!(
                f,
                "completed initial split and sort ({} records, {} chunks), starting merge",
                records, chunks
            ),
            SortEvent::MergeRoundStarted { round, files, groups } => {
                write!(f, "merge round {}: merging {} files in {} groups", round, files, groups)
            }
            SortEvent::MergeGroupStarted { round, group, files } => {
                write!(f, "merge round {}: merging {} files of group {}", round, files, group)
            }
            SortEvent::MergeGroupCompleted { round, group, records } => {
                write!(f, "merge round {}: group {} merged ({} records)", round, group, records)
            }
            SortEvent::Finalizing => write!(f, "moving sorted data to the output"),
            SortEvent::Completed { elapsed } => write!(f, "sort completed in {:.3}s", elapsed.as_secs_f64()),
        }
    }
}

/// Progress events receiver.
pub type ProgressSink = Arc<dyn Fn(&SortEvent) + Send + Sync>;

/// Progress sink forwarding events to the `log` facade.
/// Timestamps are added by the installed logger.
pub fn log_progress(event: &SortEvent) {
    log::info!("{}", event);
}
