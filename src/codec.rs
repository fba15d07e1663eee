//! Record codecs.
//!
//! A codec turns records into bytes and back. The sorter never looks inside the encoded data: it only asks
//! the codec to encode one record or to decode the next one. `Ok(None)` returned by [`Codec::decode`] marks
//! the end of the stream.

use std::error::Error;
use std::io::{self, prelude::*};
use std::marker::PhantomData;

/// Record encoding/decoding interface.
pub trait Codec<T> {
    /// Record encoding error.
    type SerializationError: Error;
    /// Record decoding error.
    type DeserializationError: Error;

    /// Writes a single record.
    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> Result<(), Self::SerializationError>;

    /// Reads the next record. Returns `Ok(None)` when the reader is exhausted.
    fn decode<R: BufRead>(&self, reader: &mut R) -> Result<Option<T>, Self::DeserializationError>;
}

/// Iterator over the records of an encoded stream.
pub struct RecordReader<'c, R, T, C> {
    reader: R,
    codec: &'c C,

    item_type: PhantomData<T>,
}

impl<'c, R, T, C> RecordReader<'c, R, T, C>
where
    R: BufRead,
    C: Codec<T>,
{
    pub fn new(reader: R, codec: &'c C) -> Self {
        RecordReader {
            reader,
            codec,
            item_type: PhantomData,
        }
    }
}

impl<'c, R, T, C> Iterator for RecordReader<'c, R, T, C>
where
    R: BufRead,
    C: Codec<T>,
{
    type Item = Result<T, C::DeserializationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.decode(&mut self.reader).transpose()
    }
}

/// RMP (Rust MessagePack) codec.
/// It uses MessagePack as a data serialization format and supports any `serde` type.
/// For more information see https://msgpack.org/.
#[derive(Clone, Copy, Debug, Default)]
pub struct RmpCodec;

impl<T> Codec<T> for RmpCodec
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    type SerializationError = rmp_serde::encode::Error;
    type DeserializationError = rmp_serde::decode::Error;

    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> Result<(), Self::SerializationError> {
        rmp_serde::encode::write(writer, item)
    }

    fn decode<R: BufRead>(&self, reader: &mut R) -> Result<Option<T>, Self::DeserializationError> {
        let exhausted = reader
            .fill_buf()
            .map_err(rmp_serde::decode::Error::InvalidMarkerRead)?
            .is_empty();
        if exhausted {
            return Ok(None);
        }

        return rmp_serde::decode::from_read(reader).map(Some);
    }
}

/// Text codec. Every record is a single UTF-8 line.
///
/// Lines are written terminated by `\n`; both `\n` and `\r\n` terminators are accepted on read and the last line
/// may lack a terminator. A record ending with `\r` is written with a `\r\n` terminator so it reads back unchanged.
/// Records containing `\n` are rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinesCodec;

impl Codec<String> for LinesCodec {
    type SerializationError = io::Error;
    type DeserializationError = io::Error;

    fn encode<W: Write>(&self, writer: &mut W, item: &String) -> Result<(), Self::SerializationError> {
        if item.contains('\n') {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "record contains a line break"));
        }

        writer.write_all(item.as_bytes())?;
        if item.ends_with('\r') {
            writer.write_all(b"\r")?;
        }
        writer.write_all(b"\n")
    }

    fn decode<R: BufRead>(&self, reader: &mut R) -> Result<Option<String>, Self::DeserializationError> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        return Ok(Some(line));
    }
}

/// Fixed-width binary record codec. Every record is exactly `record_size` bytes long.
/// A zero record size is an error on both encode and decode.
#[derive(Clone, Copy, Debug)]
pub struct FixedSizeCodec {
    record_size: usize,
}

impl FixedSizeCodec {
    pub fn new(record_size: usize) -> Self {
        FixedSizeCodec { record_size }
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    fn check_record_size(&self) -> io::Result<()> {
        if self.record_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "record size must be positive"));
        }

        return Ok(());
    }
}

impl Codec<Vec<u8>> for FixedSizeCodec {
    type SerializationError = io::Error;
    type DeserializationError = io::Error;

    fn encode<W: Write>(&self, writer: &mut W, item: &Vec<u8>) -> Result<(), Self::SerializationError> {
        self.check_record_size()?;
        if item.len() != self.record_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record length {} differs from record size {}", item.len(), self.record_size),
            ));
        }

        writer.write_all(item)
    }

    fn decode<R: BufRead>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, Self::DeserializationError> {
        self.check_record_size()?;
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut record = vec![0; self.record_size];
        reader.read_exact(&mut record)?;

        return Ok(Some(record));
    }
}
