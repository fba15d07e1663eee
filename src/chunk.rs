//! External chunks.
//!
//! A chunk is a sorted run of records stored in a temporary file. It is written once by a [`ChunkWriter`],
//! read once by a [`ChunkReader`] and deleted as soon as the reader is dropped.

use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use tempfile;

use crate::codec::{Codec, RecordReader};
use crate::tmp::TempStore;

/// External chunk error.
#[derive(Debug)]
pub enum ExternalChunkError<S> {
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(S),
}

impl<S> From<io::Error> for ExternalChunkError<S> {
    fn from(err: io::Error) -> Self {
        ExternalChunkError::IO(err)
    }
}

/// Sorted run of records persisted in a temporary file.
pub struct ExternalChunk {
    path: tempfile::TempPath,
    len: u64,
}

impl ExternalChunk {
    /// Builds a chunk file from already sorted items.
    pub fn build<'a, T, C>(
        store: &TempStore,
        codec: &C,
        items: impl IntoIterator<Item = &'a T>,
    ) -> Result<Self, ExternalChunkError<C::SerializationError>>
    where
        T: 'a,
        C: Codec<T>,
    {
        let mut chunk_writer = ChunkWriter::create(store, codec, "chunk-")?;
        for item in items {
            chunk_writer.write(item).map_err(ExternalChunkError::SerializationError)?;
        }

        return Ok(chunk_writer.finish()?);
    }

    /// Returns the number of records stored in the chunk.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the chunk for reading. The chunk file is deleted once the reader is dropped.
    pub fn open<'c, T, C>(self, store: &TempStore, codec: &'c C) -> io::Result<ChunkReader<'c, T, C>>
    where
        C: Codec<T>,
    {
        let file = fs::File::open(&self.path)?;

        return Ok(ChunkReader {
            records: RecordReader::new(store.reader(file), codec),
            path: self.path,
        });
    }

    /// Releases the chunk file guard.
    pub fn into_temp_path(self) -> tempfile::TempPath {
        self.path
    }
}

impl fmt::Debug for ExternalChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalChunk")
            .field("path", &self.path())
            .field("len", &self.len)
            .finish()
    }
}

/// Chunk file writer.
pub struct ChunkWriter<'c, C> {
    writer: io::BufWriter<fs::File>,
    path: tempfile::TempPath,
    codec: &'c C,
    len: u64,
}

impl<'c, C> ChunkWriter<'c, C> {
    /// Creates a writer to a new temporary file of the store.
    pub fn create(store: &TempStore, codec: &'c C, prefix: &str) -> io::Result<Self> {
        let (file, path) = store.create(prefix)?;

        return Ok(ChunkWriter {
            writer: store.writer(file),
            path,
            codec,
            len: 0,
        });
    }

    /// Appends a record to the chunk. Records must be written in sorted order.
    pub fn write<T>(&mut self, item: &T) -> Result<(), C::SerializationError>
    where
        C: Codec<T>,
    {
        self.codec.encode(&mut self.writer, item)?;
        self.len += 1;

        return Ok(());
    }

    /// Flushes and closes the file.
    pub fn finish(mut self) -> io::Result<ExternalChunk> {
        self.writer.flush()?;
        drop(self.writer);

        return Ok(ExternalChunk {
            path: self.path,
            len: self.len,
        });
    }
}

/// Sequential reader of a chunk file. Dropping the reader closes and deletes the file.
pub struct ChunkReader<'c, T, C> {
    // declared before the path so the file is closed before it gets deleted
    records: RecordReader<'c, io::BufReader<fs::File>, T, C>,
    path: tempfile::TempPath,
}

impl<'c, T, C> ChunkReader<'c, T, C> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<'c, T, C> Iterator for ChunkReader<'c, T, C>
where
    C: Codec<T>,
{
    type Item = Result<T, C::DeserializationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}
