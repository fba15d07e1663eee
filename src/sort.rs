//! External sorter.

use log;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{LimitedBuffer, LimitedBufferBuilder};
use crate::chunk::{ChunkReader, ChunkWriter, ExternalChunk, ExternalChunkError};
use crate::codec::{Codec, RecordReader, RmpCodec};
use crate::merger::BinaryHeapMerger;
use crate::progress::{log_progress, ProgressSink, SortEvent};
use crate::tmp::{self, TempStore};

/// Default maximum number of files merged at once.
pub const DEFAULT_MAX_FILES_PER_MERGE: usize = 100;

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error> {
    /// Sorter configuration is not valid.
    InvalidConfiguration(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(S),
    /// Data deserialization error.
    DeserializationError(D),
    /// Input data stream error
    InputError(Box<dyn Error + Send + Sync>),
}

/// Sorting error of a sorter using codec `C` for records of type `T`.
pub type CodecSortError<T, C> =
    SortError<<C as Codec<T>>::SerializationError, <C as Codec<T>>::DeserializationError>;

impl<S, D> Error for SortError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InvalidConfiguration(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
            SortError::InputError(err) => Some(&**err),
        }
    }
}

impl<S: Error, D: Error> Display for SortError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidConfiguration(msg) => write!(f, "invalid sorter configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
        }
    }
}

/// Sorting statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Number of sorted records.
    pub records: u64,
    /// Number of chunk files the input was split into.
    pub chunks: usize,
    /// Number of merge rounds performed.
    pub merge_rounds: usize,
    /// Total sorting time.
    pub elapsed: Duration,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T, C = RmpCodec>
where
    T: Send,
    C: Codec<T>,
{
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: LimitedBufferBuilder,
    /// Maximum number of files merged at once.
    max_files_per_merge: usize,
    /// Record codec.
    codec: C,
    /// Progress events receiver.
    progress: Option<ProgressSink>,

    /// Input item type.
    item_type: PhantomData<T>,
}

impl<T, C> ExternalSorterBuilder<T, C>
where
    T: Send,
    C: Codec<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self
    where
        C: Default,
    {
        ExternalSorterBuilder::default()
    }

    /// Creates an instance of a builder with default parameters using the provided codec.
    pub fn from_codec(codec: C) -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: LimitedBufferBuilder::default(),
            max_files_per_merge: DEFAULT_MAX_FILES_PER_MERGE,
            codec,
            progress: None,
            item_type: PhantomData,
        }
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    /// The configuration is validated before any file system access.
    pub fn build(self) -> Result<ExternalSorter<T, C>, CodecSortError<T, C>> {
        self.validate().map_err(SortError::InvalidConfiguration)?;

        return Ok(ExternalSorter {
            thread_pool: ExternalSorter::<T, C>::init_thread_pool(self.threads_number)?,
            tmp_dir: self.tmp_dir,
            buffer_builder: self.buffer_builder,
            max_files_per_merge: self.max_files_per_merge,
            rw_buf_size: self.rw_buf_size,
            codec: self.codec,
            progress: self.progress,
            item_type: PhantomData,
        });
    }

    fn validate(&self) -> Result<(), String> {
        if self.buffer_builder.limit() == 0 {
            return Err("max items per chunk must be positive".to_string());
        }
        if self.max_files_per_merge < 2 {
            return Err(format!(
                "max files per merge must be at least 2, got {}",
                self.max_files_per_merge
            ));
        }
        if self.rw_buf_size == Some(0) {
            return Err("read/write buffer size must be positive".to_string());
        }

        return Ok(());
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    /// By default chunks are sorted on the calling thread.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    /// By default temporary data is stored next to the output file.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets chunk buffer builder.
    pub fn with_buffer(mut self, buffer_builder: LimitedBufferBuilder) -> ExternalSorterBuilder<T, C> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets maximum number of records sorted in memory at once.
    pub fn with_max_items_per_chunk(mut self, max_items: usize) -> ExternalSorterBuilder<T, C> {
        self.buffer_builder = LimitedBufferBuilder::new(max_items, false);
        return self;
    }

    /// Sets maximum number of files merged at once.
    ///
    /// The value must be at least 2: a single file merge never reduces the number of files, so `build()` rejects
    /// 0 and 1 with [`SortError::InvalidConfiguration`].
    pub fn with_max_files_per_merge(mut self, max_files: usize) -> ExternalSorterBuilder<T, C> {
        self.max_files_per_merge = max_files;
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<T, C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets progress events receiver.
    pub fn with_progress<F>(mut self, progress: F) -> ExternalSorterBuilder<T, C>
    where
        F: Fn(&SortEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        return self;
    }

    /// Reports progress events through the `log` facade.
    pub fn with_progress_log(self) -> ExternalSorterBuilder<T, C> {
        self.with_progress(log_progress)
    }
}

impl<T, C> Default for ExternalSorterBuilder<T, C>
where
    T: Send,
    C: Codec<T> + Default,
{
    fn default() -> Self {
        ExternalSorterBuilder::from_codec(C::default())
    }
}

/// External sorter.
///
/// Sorts a record stream into a file: the input is split into chunks sorted in memory and stored in temporary
/// files, the chunks are merged in rounds of at most `max_files_per_merge` files until a single file remains,
/// and that file is atomically moved to the output path.
pub struct ExternalSorter<T, C = RmpCodec>
where
    T: Send,
    C: Codec<T>,
{
    /// Chunk sorting thread pool.
    thread_pool: Option<rayon::ThreadPool>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk buffer builder.
    buffer_builder: LimitedBufferBuilder,
    /// Maximum number of files merged at once.
    max_files_per_merge: usize,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Record codec.
    codec: C,
    /// Progress events receiver.
    progress: Option<ProgressSink>,

    /// Input item type.
    item_type: PhantomData<T>,
}

impl<T, C> ExternalSorter<T, C>
where
    T: Send,
    C: Codec<T>,
{
    fn init_thread_pool(threads_number: Option<usize>) -> Result<Option<rayon::ThreadPool>, CodecSortError<T, C>> {
        let threads_number = match threads_number {
            Some(threads_number) => threads_number,
            None => return Ok(None),
        };

        log::info!("initializing thread-pool (threads: {})", threads_number);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads_number)
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(Some(thread_pool));
    }

    /// Returns the record codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Sorts encoded records read from the input and writes the result to the output file.
    ///
    /// # Arguments
    /// * `input` - Input stream records to be decoded from
    /// * `output` - Result file path
    pub fn sort<R>(&self, input: R, output: &Path) -> Result<SortStats, CodecSortError<T, C>>
    where
        T: Ord,
        R: io::Read,
    {
        self.sort_by(input, output, T::cmp)
    }

    /// Sorts encoded records read from the input using a custom compare function.
    ///
    /// # Arguments
    /// * `input` - Input stream records to be decoded from
    /// * `output` - Result file path
    /// * `compare` - Function be be used to compare items
    pub fn sort_by<R, F>(&self, input: R, output: &Path, compare: F) -> Result<SortStats, CodecSortError<T, C>>
    where
        R: io::Read,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let input = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, input),
            None => io::BufReader::new(input),
        };
        let records =
            RecordReader::<_, T, C>::new(input, &self.codec).map(|item| item.map_err(SortError::DeserializationError));

        self.sort_records(records, output, compare)
    }

    /// Sorts encoded records of the input file.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats, CodecSortError<T, C>>
    where
        T: Ord,
    {
        self.sort_file_by(input, output, T::cmp)
    }

    /// Sorts encoded records of the input file using a custom compare function.
    pub fn sort_file_by<F>(&self, input: &Path, output: &Path, compare: F) -> Result<SortStats, CodecSortError<T, C>>
    where
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let input = fs::File::open(input).map_err(SortError::IO)?;
        self.sort_by(input, output, compare)
    }

    /// Sorts records produced by an iterator.
    pub fn sort_items<I, E>(&self, items: I, output: &Path) -> Result<SortStats, CodecSortError<T, C>>
    where
        T: Ord,
        I: IntoIterator<Item = Result<T, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        self.sort_items_by(items, output, T::cmp)
    }

    /// Sorts records produced by an iterator using a custom compare function.
    ///
    /// # Arguments
    /// * `items` - Input records
    /// * `output` - Result file path
    /// * `compare` - Function be be used to compare items
    pub fn sort_items_by<I, E, F>(&self, items: I, output: &Path, compare: F) -> Result<SortStats, CodecSortError<T, C>>
    where
        I: IntoIterator<Item = Result<T, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let records = items
            .into_iter()
            .map(|item| item.map_err(|err| SortError::InputError(err.into())));

        self.sort_records(records, output, compare)
    }

    fn sort_records<I, F>(&self, records: I, output: &Path, compare: F) -> Result<SortStats, CodecSortError<T, C>>
    where
        I: Iterator<Item = Result<T, CodecSortError<T, C>>>,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let started = Instant::now();
        let mut stats = SortStats::default();
        self.report(SortEvent::Started);

        let store = self.init_tmp_store(output)?;

        let mut chunks = self.split(records, &store, &compare, &mut stats)?;
        stats.chunks = chunks.len();
        self.report(SortEvent::SplitCompleted {
            chunks: stats.chunks,
            records: stats.records,
        });

        while chunks.len() > 1 {
            stats.merge_rounds += 1;
            chunks = self.merge_round(stats.merge_rounds, chunks, &store, &compare)?;
        }

        self.report(SortEvent::Finalizing);
        match chunks.pop() {
            Some(chunk) => store.finalize(chunk.into_temp_path(), output),
            None => store.finalize_empty(output),
        }
        .map_err(SortError::IO)?;

        stats.elapsed = started.elapsed();
        self.report(SortEvent::Completed { elapsed: stats.elapsed });

        return Ok(stats);
    }

    fn init_tmp_store(&self, output: &Path) -> Result<TempStore, CodecSortError<T, C>> {
        let base = self.tmp_dir.as_deref().unwrap_or_else(|| tmp::output_dir(output));

        TempStore::new(base, self.rw_buf_size).map_err(|err| SortError::TempDir(err))
    }

    fn split<I, F>(
        &self,
        records: I,
        store: &TempStore,
        compare: &F,
        stats: &mut SortStats,
    ) -> Result<Vec<ExternalChunk>, CodecSortError<T, C>>
    where
        I: Iterator<Item = Result<T, CodecSortError<T, C>>>,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let mut chunk_buf = self.buffer_builder.build();
        let mut external_chunks = Vec::new();

        for item in records {
            chunk_buf.push(item?);
            stats.records += 1;

            if chunk_buf.is_full() {
                external_chunks.push(self.create_chunk(&mut chunk_buf, store, compare, external_chunks.len())?);
            }
        }

        if !chunk_buf.is_empty() {
            external_chunks.push(self.create_chunk(&mut chunk_buf, store, compare, external_chunks.len())?);
        }

        log::debug!("external sort preparation done ({} chunks)", external_chunks.len());

        return Ok(external_chunks);
    }

    fn create_chunk<F>(
        &self,
        buffer: &mut LimitedBuffer<T>,
        store: &TempStore,
        compare: &F,
        chunk_idx: usize,
    ) -> Result<ExternalChunk, CodecSortError<T, C>>
    where
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        log::debug!("sorting chunk data ...");
        match &self.thread_pool {
            Some(thread_pool) => thread_pool.install(|| buffer.par_sort_by(compare)),
            None => buffer.sort_by(compare),
        }
        self.report(SortEvent::ChunkSorted {
            chunk: chunk_idx,
            records: buffer.len(),
        });

        log::debug!("saving chunk data");
        let external_chunk = ExternalChunk::build(store, &self.codec, buffer.iter()).map_err(|err| match err {
            ExternalChunkError::IO(err) => SortError::IO(err),
            ExternalChunkError::SerializationError(err) => SortError::SerializationError(err),
        })?;
        buffer.clear();

        return Ok(external_chunk);
    }

    fn merge_round<F>(
        &self,
        round: usize,
        chunks: Vec<ExternalChunk>,
        store: &TempStore,
        compare: &F,
    ) -> Result<Vec<ExternalChunk>, CodecSortError<T, C>>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        let groups = (chunks.len() + self.max_files_per_merge - 1) / self.max_files_per_merge;
        self.report(SortEvent::MergeRoundStarted {
            round,
            files: chunks.len(),
            groups,
        });

        let mut merged = Vec::with_capacity(groups);
        let mut chunks = chunks.into_iter();
        loop {
            let group = Vec::from_iter(chunks.by_ref().take(self.max_files_per_merge));
            if group.is_empty() {
                break;
            }

            let group_idx = merged.len();
            self.report(SortEvent::MergeGroupStarted {
                round,
                group: group_idx,
                files: group.len(),
            });
            let chunk = self.merge_group(group, store, compare)?;
            self.report(SortEvent::MergeGroupCompleted {
                round,
                group: group_idx,
                records: chunk.len(),
            });
            merged.push(chunk);
        }

        return Ok(merged);
    }

    /// Merges a group of chunks into a single one. Input chunk files are deleted as soon as they are consumed.
    fn merge_group<F>(
        &self,
        mut group: Vec<ExternalChunk>,
        store: &TempStore,
        compare: &F,
    ) -> Result<ExternalChunk, CodecSortError<T, C>>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        if group.len() == 1 {
            log::debug!("single chunk group passed through");
            return Ok(group.remove(0));
        }

        log::debug!("merging {} chunks", group.len());
        let inputs: Vec<ChunkReader<T, C>> = group
            .into_iter()
            .map(|chunk| chunk.open(store, &self.codec))
            .collect::<io::Result<_>>()
            .map_err(SortError::IO)?;

        let mut chunk_writer = ChunkWriter::create(store, &self.codec, "merge-").map_err(SortError::IO)?;
        for item in BinaryHeapMerger::new(inputs, compare) {
            let item = item.map_err(SortError::DeserializationError)?;
            chunk_writer.write(&item).map_err(SortError::SerializationError)?;
        }

        chunk_writer.finish().map_err(SortError::IO)
    }

    fn report(&self, event: SortEvent) {
        if let Some(progress) = &self.progress {
            progress(&event);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::collections::HashSet;
    use std::fs;
    use std::io::{self, prelude::*};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::codec::{Codec, FixedSizeCodec, LinesCodec, RecordReader, RmpCodec};
    use crate::progress::SortEvent;
    use crate::LimitedBufferBuilder;

    /// Big-endian 4 byte integer codec.
    #[derive(Clone, Copy, Default)]
    struct I32Codec;

    impl Codec<i32> for I32Codec {
        type SerializationError = io::Error;
        type DeserializationError = io::Error;

        fn encode<W: Write>(&self, writer: &mut W, item: &i32) -> io::Result<()> {
            writer.write_all(&item.to_be_bytes())
        }

        fn decode<R: BufRead>(&self, reader: &mut R) -> io::Result<Option<i32>> {
            if reader.fill_buf()?.is_empty() {
                return Ok(None);
            }

            let mut buf = [0; 4];
            reader.read_exact(&mut buf)?;

            return Ok(Some(i32::from_be_bytes(buf)));
        }
    }

    thread_local! {
        static LIVE_READERS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
        static PEAK_LIVE_READERS: Cell<usize> = Cell::new(0);
    }

    /// [`I32Codec`] tracking the readers that are being decoded and not exhausted yet on the current thread.
    #[derive(Clone, Copy, Default)]
    struct ReaderTrackingCodec;

    impl ReaderTrackingCodec {
        fn reset() {
            LIVE_READERS.with(|live| live.borrow_mut().clear());
            PEAK_LIVE_READERS.with(|peak| peak.set(0));
        }

        fn peak_live_readers() -> usize {
            PEAK_LIVE_READERS.with(|peak| peak.get())
        }
    }

    impl Codec<i32> for ReaderTrackingCodec {
        type SerializationError = io::Error;
        type DeserializationError = io::Error;

        fn encode<W: Write>(&self, writer: &mut W, item: &i32) -> io::Result<()> {
            I32Codec.encode(writer, item)
        }

        fn decode<R: BufRead>(&self, reader: &mut R) -> io::Result<Option<i32>> {
            let reader_id = &*reader as *const R as usize;
            let item = I32Codec.decode(reader)?;

            LIVE_READERS.with(|live| {
                let mut live = live.borrow_mut();
                match item {
                    Some(_) => live.insert(reader_id),
                    None => live.remove(&reader_id),
                };
                PEAK_LIVE_READERS.with(|peak| peak.set(peak.get().max(live.len())));
            });

            return Ok(item);
        }
    }

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn read_output<T, C: Codec<T>>(path: &Path, codec: &C) -> Vec<T> {
        let reader = io::BufReader::new(fs::File::open(path).unwrap());
        let result: Result<Vec<T>, _> = RecordReader::new(reader, codec).collect();
        result.unwrap()
    }

    fn collect_events<T: Send, C: Codec<T>>(
        builder: ExternalSorterBuilder<T, C>,
    ) -> (ExternalSorterBuilder<T, C>, Arc<Mutex<Vec<SortEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let builder = builder.with_progress(move |event: &SortEvent| sink.lock().unwrap().push(event.clone()));

        (builder, events)
    }

    fn merge_group_sizes(events: &[SortEvent]) -> Vec<Vec<usize>> {
        let mut rounds: Vec<Vec<usize>> = Vec::new();
        for event in events {
            match event {
                SortEvent::MergeRoundStarted { .. } => rounds.push(Vec::new()),
                SortEvent::MergeGroupStarted { files, .. } => rounds.last_mut().unwrap().push(*files),
                _ => {}
            }
        }
        rounds
    }

    fn sort_bytes(input: &str, tmp_dir: &Path) -> String {
        let output = tmp_dir.join("output");
        let input_path = tmp_dir.join("input");
        fs::write(&input_path, input).unwrap();

        let sorter: ExternalSorter<Vec<u8>, FixedSizeCodec> = ExternalSorterBuilder::from_codec(FixedSizeCodec::new(1))
            .with_max_items_per_chunk(2)
            .with_max_files_per_merge(3)
            .build()
            .unwrap();
        sorter.sort_file(&input_path, &output).unwrap();

        String::from_utf8(fs::read(&output).unwrap()).unwrap()
    }

    #[rstest]
    #[case("", "")]
    #[case("1", "1")]
    #[case("21", "12")]
    #[case("231", "123")]
    #[case("2431", "1234")]
    #[case("1432", "1234")]
    #[case("242312", "122234")]
    fn test_sort_small_inputs(tmp_dir: tempfile::TempDir, #[case] input: &str, #[case] expected: &str) {
        assert_eq!(sort_bytes(input, tmp_dir.path()), expected);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input_sorted = 0..100;

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());

        let input: Vec<Result<i32, io::Error>> = Vec::from_iter(input_shuffled.into_iter().map(|item| Ok(item)));

        let sorter: ExternalSorter<i32> = ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let compare = if reversed {
            |a: &i32, b: &i32| a.cmp(b).reverse()
        } else {
            |a: &i32, b: &i32| a.cmp(b)
        };

        let output = tmp_dir.path().join("output");
        let stats = sorter.sort_items_by(input, &output, compare).unwrap();
        assert_eq!(stats.records, 100);
        assert_eq!(stats.chunks, 13);

        let actual_result: Vec<i32> = read_output(&output, &RmpCodec);
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter_stability(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input_sorted = (0..20).flat_map(|x| (0..5).map(move |y| (x, y)));

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        // sort input by the second field to check sorting stability
        input_shuffled.sort_by(|a: &(i32, i32), b: &(i32, i32)| {
            if reversed {
                a.1.cmp(&b.1).reverse()
            } else {
                a.1.cmp(&b.1)
            }
        });

        let input: Vec<Result<(i32, i32), io::Error>> = Vec::from_iter(input_shuffled.into_iter().map(|item| Ok(item)));

        let sorter: ExternalSorter<(i32, i32)> = ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_max_files_per_merge(3)
            .build()
            .unwrap();

        let compare = if reversed {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0).reverse()
        } else {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0)
        };

        let output = tmp_dir.path().join("output");
        sorter.sort_items_by(input, &output, compare).unwrap();

        let actual_result: Vec<(i32, i32)> = read_output(&output, &RmpCodec);
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    fn test_sort_lines(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(2)
            .with_max_files_per_merge(3)
            .build()
            .unwrap();

        sorter.sort("c\ndef\nab".as_bytes(), &output).unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "ab\nc\ndef\n");
    }

    #[rstest]
    fn test_sort_lines_trailing_carriage_return(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(1)
            .build()
            .unwrap();

        sorter.sort("b\na\r\r\n\r\r\n".as_bytes(), &output).unwrap();

        assert_eq!(read_output::<String, _>(&output, &LinesCodec), vec!["\r", "a\r", "b"]);
    }

    #[rstest]
    fn test_duplicates_preserved(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        let input: Vec<Result<i32, io::Error>> = vec![Ok(2), Ok(4), Ok(2), Ok(3), Ok(1), Ok(2)];
        let sorter: ExternalSorter<i32> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(2)
            .with_max_files_per_merge(3)
            .build()
            .unwrap();

        let stats = sorter.sort_items(input, &output).unwrap();

        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.merge_rounds, 1);
        assert_eq!(read_output::<i32, _>(&output, &RmpCodec), vec![1, 2, 2, 2, 3, 4]);
    }

    #[rstest]
    fn test_multi_round_merge(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        let input = Vec::from_iter((0..14).rev().map(|item| Ok::<i32, io::Error>(item)));
        let (builder, events) = collect_events(
            ExternalSorterBuilder::<i32, RmpCodec>::new()
                .with_max_items_per_chunk(2)
                .with_max_files_per_merge(3),
        );
        let sorter = builder.build().unwrap();

        let stats = sorter.sort_items(input, &output).unwrap();

        assert_eq!(stats.chunks, 7);
        assert_eq!(stats.merge_rounds, 2);
        assert_eq!(merge_group_sizes(&events.lock().unwrap()), vec![vec![3, 3, 1], vec![3]]);
        assert_eq!(read_output::<i32, _>(&output, &RmpCodec), Vec::from_iter(0..14));
    }

    #[rstest]
    #[case(1, 2)]
    #[case(3, 2)]
    #[case(7, 5)]
    #[case(10, 100)]
    fn test_merge_fan_in_bound(tmp_dir: tempfile::TempDir, #[case] chunk_size: usize, #[case] max_files: usize) {
        let output = tmp_dir.path().join("output");
        let mut input = Vec::from_iter(0..500);
        input.shuffle(&mut rand::thread_rng());
        let (builder, events) = collect_events(
            ExternalSorterBuilder::<i32, ReaderTrackingCodec>::new()
                .with_max_items_per_chunk(chunk_size)
                .with_max_files_per_merge(max_files),
        );
        let sorter = builder.build().unwrap();
        ReaderTrackingCodec::reset();

        sorter
            .sort_items(input.into_iter().map(|item| Ok::<i32, io::Error>(item)), &output)
            .unwrap();

        let events = events.lock().unwrap();
        let groups = merge_group_sizes(&events);
        assert!(groups.iter().flatten().all(|files| *files <= max_files));
        assert_eq!(groups.last().map(|round| round.len()), Some(1));
        // chunk readers of a group are the only open inputs besides the single merge writer
        let chunks = (500 + chunk_size - 1) / chunk_size;
        assert_eq!(ReaderTrackingCodec::peak_live_readers(), max_files.min(chunks));
        assert_eq!(read_output::<i32, _>(&output, &I32Codec), Vec::from_iter(0..500));
    }

    #[rstest]
    fn test_progress_events(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        let (builder, events) = collect_events(
            ExternalSorterBuilder::<i32, RmpCodec>::new()
                .with_max_items_per_chunk(2)
                .with_max_files_per_merge(2),
        );
        let sorter = builder.build().unwrap();

        sorter
            .sort_items(vec![Ok::<i32, io::Error>(3), Ok(1), Ok(2)], &output)
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            &events[..events.len() - 1],
            &[
                SortEvent::Started,
                SortEvent::ChunkSorted { chunk: 0, records: 2 },
                SortEvent::ChunkSorted { chunk: 1, records: 1 },
                SortEvent::SplitCompleted { chunks: 2, records: 3 },
                SortEvent::MergeRoundStarted {
                    round: 1,
                    files: 2,
                    groups: 1
                },
                SortEvent::MergeGroupStarted {
                    round: 1,
                    group: 0,
                    files: 2
                },
                SortEvent::MergeGroupCompleted {
                    round: 1,
                    group: 0,
                    records: 3
                },
                SortEvent::Finalizing,
            ]
        );
        assert!(matches!(events.last(), Some(SortEvent::Completed { .. })));
    }

    #[rstest]
    fn test_empty_input_truncates_output(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        fs::write(&output, "previous content").unwrap();
        let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new().build().unwrap();

        let stats = sorter.sort(io::empty(), &output).unwrap();

        assert_eq!(stats.records, 0);
        assert_eq!(stats.chunks, 0);
        assert!(output.exists());
        assert_eq!(read_output::<String, _>(&output, &LinesCodec), Vec::<String>::new());
    }

    #[rstest]
    fn test_single_record(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new().build().unwrap();

        let stats = sorter.sort("only".as_bytes(), &output).unwrap();

        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.merge_rounds, 0);
        assert_eq!(fs::read_to_string(&output).unwrap(), "only\n");
    }

    #[rstest]
    fn test_sorted_input_reproduced(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input");
        let first = tmp_dir.path().join("first");
        let second = tmp_dir.path().join("second");
        let mut data = Vec::from_iter((0..1000).map(|_| rand::thread_rng().gen_range(0..100)));
        data.sort();
        fs::write(&input, data.iter().flat_map(|item: &i32| item.to_be_bytes()).collect::<Vec<u8>>()).unwrap();

        let sorter: ExternalSorter<i32, I32Codec> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(64)
            .with_max_files_per_merge(4)
            .build()
            .unwrap();
        sorter.sort_file(&input, &first).unwrap();
        sorter.sort_file(&first, &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&input).unwrap());
        assert_eq!(fs::read(&second).unwrap(), fs::read(&first).unwrap());
    }

    #[rstest]
    fn test_temporary_files_removed(tmp_dir: tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let output = tmp_dir.path().join("output");
        let sorter: ExternalSorter<i32> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(3)
            .with_max_files_per_merge(2)
            .with_tmp_dir(work_dir.path())
            .build()
            .unwrap();

        sorter
            .sort_items((0..50).rev().map(|item| Ok::<i32, io::Error>(item)), &output)
            .unwrap();

        assert_eq!(fs::read_dir(work_dir.path()).unwrap().count(), 0);
        assert_eq!(read_output::<i32, _>(&output, &RmpCodec), Vec::from_iter(0..50));
    }

    #[rstest]
    fn test_input_error_cleans_up(tmp_dir: tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let output = tmp_dir.path().join("output");
        let sorter: ExternalSorter<i32> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(3)
            .with_tmp_dir(work_dir.path())
            .build()
            .unwrap();

        let input = (0..10)
            .map(|item| Ok(item))
            .chain(std::iter::once(Err(io::Error::new(io::ErrorKind::Other, "broken input"))));
        let result = sorter.sort_items(input, &output);

        assert!(matches!(result, Err(SortError::InputError(_))));
        assert!(!output.exists());
        assert_eq!(fs::read_dir(work_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_decode_error_keeps_output(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output");
        fs::write(&output, "previous content").unwrap();
        let sorter: ExternalSorter<Vec<u8>, FixedSizeCodec> = ExternalSorterBuilder::from_codec(FixedSizeCodec::new(2))
            .with_max_items_per_chunk(1)
            .build()
            .unwrap();

        let result = sorter.sort([4u8, 3, 2, 1, 0].as_slice(), &output);

        match result {
            Err(SortError::DeserializationError(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other.map(|stats| stats.records)),
        }
        assert_eq!(fs::read_to_string(&output).unwrap(), "previous content");
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    fn test_missing_input_file(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<String, LinesCodec> = ExternalSorterBuilder::new().build().unwrap();

        let result = sorter.sort_file(&tmp_dir.path().join("missing"), &tmp_dir.path().join("output"));

        assert!(matches!(result, Err(SortError::IO(_))));
    }

    #[rstest]
    #[case(0, 100, None)]
    #[case(10, 0, None)]
    #[case(10, 1, None)]
    #[case(10, 2, Some(0))]
    fn test_invalid_configuration(
        #[case] max_items: usize,
        #[case] max_files: usize,
        #[case] rw_buf_size: Option<usize>,
    ) {
        let mut builder = ExternalSorterBuilder::<i32, RmpCodec>::new()
            .with_max_items_per_chunk(max_items)
            .with_max_files_per_merge(max_files)
            .with_tmp_dir(Path::new("/nonexistent/ext-sort"));
        if let Some(rw_buf_size) = rw_buf_size {
            builder = builder.with_rw_buf_size(rw_buf_size);
        }

        assert!(matches!(builder.build(), Err(SortError::InvalidConfiguration(_))));
    }

    #[rstest]
    fn test_concurrent_invocations(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i32> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(10)
            .with_max_files_per_merge(3)
            .build()
            .unwrap();

        std::thread::scope(|scope| {
            for idx in 0..4 {
                let sorter = &sorter;
                let output = tmp_dir.path().join(format!("output-{}", idx));
                scope.spawn(move || {
                    let mut input = Vec::from_iter(0..200);
                    input.shuffle(&mut rand::thread_rng());
                    sorter
                        .sort_items(input.into_iter().map(|item| Ok::<i32, io::Error>(item)), &output)
                        .unwrap();
                    assert_eq!(read_output::<i32, _>(&output, &RmpCodec), Vec::from_iter(0..200));
                });
            }
        });
    }

    #[rstest]
    #[case(1_000)]
    #[case(10_000)]
    #[case(100_000)]
    #[case(1_000_000)]
    fn test_random_integers(tmp_dir: tempfile::TempDir, #[case] n: usize) {
        let input = tmp_dir.path().join("input");
        let output = tmp_dir.path().join("output");

        let mut rng = rand::thread_rng();
        let mut total: i64 = 0;
        let mut writer = io::BufWriter::new(fs::File::create(&input).unwrap());
        for _ in 0..n {
            let value: i32 = rng.gen_range(0..1000);
            total += value as i64;
            I32Codec.encode(&mut writer, &value).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        let sorter: ExternalSorter<i32, I32Codec> = ExternalSorterBuilder::new()
            .with_max_items_per_chunk(n / 20)
            .with_max_files_per_merge(4)
            .with_rw_buf_size(64 * 1024)
            .build()
            .unwrap();
        let stats = sorter.sort_file(&input, &output).unwrap();
        assert_eq!(stats.records, n as u64);
        assert_eq!(stats.merge_rounds, 3);

        let sorted: Vec<i32> = read_output(&output, &I32Codec);
        assert_eq!(sorted.len(), n);
        assert!(sorted.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(sorted.iter().map(|value| *value as i64).sum::<i64>(), total);
    }
}
