//! Persisted output sink (§6.2). Real deployments of this pipeline write
//! to HDF5; on-disk HDF5 output is explicitly out of scope here, but the
//! sink's observable contract — one growing dataset per processor output,
//! rotated by size, each record carrying its originating chunk's
//! attributes — is not, so this is a small self-contained bincode-framed
//! container standing in for it.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use streamboard_foundation::chunk::Chunk;
use streamboard_foundation::error::ResourceError;

/// One persisted record: the chunk payload plus the attributes a reader
/// needs without re-deriving them (continuity, numbering, provenance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub number: u64,
    pub start_time: f64,
    pub fs: f64,
    pub continuity: streamboard_foundation::continuity::Continuity,
    pub processor_name: String,
    pub identifier: Option<String>,
    pub payload: streamboard_foundation::chunk::ChunkPayload,
}

impl From<&Chunk> for PersistedRecord {
    fn from(chunk: &Chunk) -> Self {
        Self {
            number: chunk.number,
            start_time: chunk.start_time,
            fs: chunk.fs,
            continuity: chunk.continuity,
            processor_name: chunk.processor_name.clone(),
            identifier: chunk.identifier.clone(),
            payload: chunk.payload.clone(),
        }
    }
}

/// Destination for a processor's published chunks. Implementations decide
/// how (and whether) to persist; `write_chunk` is called once per
/// completed chunk in publish order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), ResourceError>;
    async fn flush(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Writes length-prefixed bincode records to a file, rotating to a new
/// file once the current one exceeds `max_bytes`.
pub struct RotatingFileSink {
    directory: PathBuf,
    stem: String,
    max_bytes: u64,
    file_index: u64,
    bytes_written: u64,
    writer: BufWriter<File>,
}

impl RotatingFileSink {
    pub fn open(
        directory: impl Into<PathBuf>,
        stem: impl Into<String>,
        max_bytes: u64,
    ) -> Result<Self, ResourceError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        let stem = stem.into();
        let file_index = 0;
        let path = Self::path_for(&directory, &stem, file_index);
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?,
        );
        Ok(Self {
            directory,
            stem,
            max_bytes: max_bytes.max(1),
            file_index,
            bytes_written: 0,
            writer,
        })
    }

    fn path_for(directory: &Path, stem: &str, index: u64) -> PathBuf {
        directory.join(format!("{stem}.{index:05}.sbdata"))
    }

    fn rotate(&mut self) -> Result<(), ResourceError> {
        self.writer.flush()?;
        self.file_index += 1;
        self.bytes_written = 0;
        let path = Self::path_for(&self.directory, &self.stem, self.file_index);
        self.writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?,
        );
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for RotatingFileSink {
    async fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), ResourceError> {
        let record = PersistedRecord::from(chunk);
        let bytes = bincode::serialize(&record)
            .map_err(|e| ResourceError::FileUnwritable(format!("failed to serialize record: {e}")))?;

        if self.bytes_written > 0 && self.bytes_written + bytes.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        self.writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        self.writer.write_all(&bytes)?;
        self.bytes_written += 4 + bytes.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ResourceError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads back every record written by [`RotatingFileSink`] across its
/// rotated files, in order. Test/inspection helper, not used on the
/// board's hot path.
pub fn read_all_records(directory: impl AsRef<Path>, stem: &str) -> Result<Vec<PersistedRecord>, ResourceError> {
    use byteorder::ReadBytesExt;
    use std::io::Read;

    let mut records = Vec::new();
    let mut index = 0u64;
    loop {
        let path = RotatingFileSink::path_for(directory.as_ref(), stem, index);
        if !path.exists() {
            break;
        }
        let mut file = File::open(&path)?;
        loop {
            let len = match file.read_u32::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ResourceError::Io(e)),
            };
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            let record: PersistedRecord = bincode::deserialize(&buf)
                .map_err(|e| ResourceError::FileUnwritable(format!("corrupt record: {e}")))?;
            records.push(record);
        }
        index += 1;
    }
    Ok(records)
}

/// Per-run attribute tracking: the sink keeps a running count and the
/// last-seen chunk number per processor, so a final summary can be
/// written alongside the data without a second pass over it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SinkSummary {
    pub records_written: BTreeMap<String, u64>,
    pub last_number: BTreeMap<String, u64>,
}

impl SinkSummary {
    pub fn observe(&mut self, chunk: &Chunk) {
        *self.records_written.entry(chunk.processor_name.clone()).or_insert(0) += 1;
        self.last_number.insert(chunk.processor_name.clone(), chunk.number);
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ResourceError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ResourceError::FileUnwritable(format!("failed to serialize summary: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamboard_foundation::alignment::ChunkAlignment;
    use streamboard_foundation::chunk::ChunkPayload;
    use streamboard_foundation::continuity::Continuity;
    use std::collections::BTreeSet;

    fn test_chunk(number: u64, payload_len: usize) -> Chunk {
        Chunk {
            payload: ChunkPayload::Series1(vec![0.0; payload_len]),
            start_time: number as f64,
            fs: 16_000.0,
            number,
            continuity: Continuity::WithPrevious,
            alignment: ChunkAlignment::new(0, 0, 0, 0, 16_000.0),
            processor_name: "sink_test".into(),
            sources: BTreeSet::new(),
            identifier: None,
            data_generation_time: BTreeMap::new(),
            metadata: BTreeMap::new(),
            initial_sample_time: None,
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RotatingFileSink::open(dir.path(), "stream", 1 << 20).unwrap();
        for i in 0..5 {
            sink.write_chunk(&test_chunk(i, 10)).await.unwrap();
        }
        sink.flush().await.unwrap();

        let records = read_all_records(dir.path(), "stream").unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].number, 4);
    }

    #[tokio::test]
    async fn rotates_to_a_new_file_once_max_bytes_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RotatingFileSink::open(dir.path(), "stream", 64).unwrap();
        for i in 0..20 {
            sink.write_chunk(&test_chunk(i, 20)).await.unwrap();
        }
        sink.flush().await.unwrap();

        assert!(RotatingFileSink::path_for(dir.path(), "stream", 1).exists());
        let records = read_all_records(dir.path(), "stream").unwrap();
        assert_eq!(records.len(), 20);
    }

    #[tokio::test]
    async fn summary_tracks_last_number_per_processor() {
        let mut summary = SinkSummary::default();
        for i in 0..3 {
            summary.observe(&test_chunk(i, 4));
        }
        assert_eq!(summary.records_written["sink_test"], 3);
        assert_eq!(summary.last_number["sink_test"], 2);
    }
}
