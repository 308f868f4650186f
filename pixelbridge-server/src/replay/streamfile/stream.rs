//! Buffered, optionally-compressed event file I/O.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

use super::Compression;

// Large buffer (4 MiB) to amortize event file I/O.
const STREAM_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// A writer for one event file, applying the configured compression over a
/// large buffered base file.
pub(super) enum RawStreamWriter {
    Plain(BufWriter<File>),
    Snappy(Box<FrameEncoder<BufWriter<File>>>),
    Gzip(Box<GzEncoder<BufWriter<File>>>),
}

impl RawStreamWriter {
    pub(super) fn new(file: File, compression: Compression, level: Option<u32>) -> Self {
        let base = BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);
        match compression {
            Compression::None => RawStreamWriter::Plain(base),
            Compression::Snappy => RawStreamWriter::Snappy(Box::new(FrameEncoder::new(base))),
            Compression::Gzip => {
                let level = match level {
                    Some(l) => flate2::Compression::new(l),
                    None => flate2::Compression::default(),
                };
                RawStreamWriter::Gzip(Box::new(GzEncoder::new(base, level)))
            }
        }
    }

    /// Finalizes the compression stream and flushes the base file.
    pub(super) fn finish(self) -> io::Result<()> {
        match self {
            RawStreamWriter::Plain(mut w) => w.flush(),
            RawStreamWriter::Snappy(enc) => {
                let mut base = enc
                    .into_inner()
                    .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?;
                base.flush()
            }
            RawStreamWriter::Gzip(enc) => {
                let mut base = enc.finish()?;
                base.flush()
            }
        }
    }
}

impl Write for RawStreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RawStreamWriter::Plain(w) => w.write(buf),
            RawStreamWriter::Snappy(w) => w.write(buf),
            RawStreamWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RawStreamWriter::Plain(w) => w.flush(),
            RawStreamWriter::Snappy(w) => w.flush(),
            RawStreamWriter::Gzip(w) => w.flush(),
        }
    }
}

/// A reader for one event file, reversing the compression recorded in its
/// metadata entry.
pub(super) enum RawStreamReader {
    Plain(BufReader<File>),
    Snappy(Box<FrameDecoder<BufReader<File>>>),
    Gzip(Box<GzDecoder<BufReader<File>>>),
}

impl RawStreamReader {
    pub(super) fn new(file: File, compression: Compression) -> Self {
        let base = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
        match compression {
            Compression::None => RawStreamReader::Plain(base),
            Compression::Snappy => RawStreamReader::Snappy(Box::new(FrameDecoder::new(base))),
            Compression::Gzip => RawStreamReader::Gzip(Box::new(GzDecoder::new(base))),
        }
    }
}

impl Read for RawStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawStreamReader::Plain(r) => r.read(buf),
            RawStreamReader::Snappy(r) => r.read(buf),
            RawStreamReader::Gzip(r) => r.read(buf),
        }
    }
}
