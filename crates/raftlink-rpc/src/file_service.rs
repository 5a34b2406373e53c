//! Chunked file serving for snapshot transfer.
//!
//! The leader registers a [`FileReader`] per snapshot being sent and hands
//! the returned reader id to the follower, which then pulls the files in
//! byte ranges with `getFile` requests until it sees `eof`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::{ErrorResponse, RaftErrorCode};
use crate::message::{GetFileRequest, GetFileResponse};

/// Result of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes appended to the buffer.
    pub read: usize,
    /// The read reached the end of the file.
    pub eof: bool,
}

#[derive(Debug, Error)]
pub enum FileReadError {
    /// The data is temporarily unavailable; the caller should back off.
    #[error("retry later: {0}")]
    RetryAgain(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads byte ranges of the files in one snapshot.
pub trait FileReader: Send + Sync {
    /// Directory or logical location, used in logs and error messages.
    fn path(&self) -> &Path;

    /// Append at most `max_count` bytes of `filename`, starting at `offset`,
    /// to `buf`.
    fn read_file(
        &self,
        buf: &mut BytesMut,
        filename: &str,
        offset: u64,
        max_count: u64,
    ) -> Result<ReadOutcome, FileReadError>;
}

/// Serves files under one local directory.
#[derive(Debug, Clone)]
pub struct LocalDirReader {
    path: PathBuf,
}

impl LocalDirReader {
    /// Serve the files directly under `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Only plain relative names are served; anything that could escape the
    /// directory is rejected.
    fn resolve(&self, filename: &str) -> io::Result<PathBuf> {
        let relative = Path::new(filename);
        let plain = !filename.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name '{filename}'"),
            ));
        }
        Ok(self.path.join(relative))
    }
}

impl FileReader for LocalDirReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(
        &self,
        buf: &mut BytesMut,
        filename: &str,
        offset: u64,
        max_count: u64,
    ) -> Result<ReadOutcome, FileReadError> {
        let mut file = File::open(self.resolve(filename)?)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(ReadOutcome { read: 0, eof: true });
        }
        file.seek(SeekFrom::Start(offset))?;

        let want = usize::try_from(max_count.min(len - offset))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read size overflows usize"))?;
        let start = buf.len();
        buf.resize(start + want, 0);
        let mut read = 0;
        while read < want {
            match file.read(&mut buf[start + read..start + want]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    buf.truncate(start);
                    return Err(e.into());
                }
            }
        }
        buf.truncate(start + read);
        Ok(ReadOutcome {
            read,
            eof: offset + read as u64 >= len,
        })
    }
}

// ── Service ────────────────────────────────────────────────────────

/// Largest chunk a single `getFile` reply carries unless configured otherwise.
pub const DEFAULT_MAX_CHUNK_BYTES: i64 = 4 * 1024 * 1024;

/// Registry of active readers, keyed by reader id.
pub struct FileService {
    readers: DashMap<i64, Arc<dyn FileReader>>,
    next_id: AtomicI64,
    max_chunk_bytes: i64,
}

/// Reader ids start from a value derived from the process id and the
/// clock, so ids handed out before a restart are unlikely to be reused.
fn initial_reader_id() -> i64 {
    let pid = i64::from(std::process::id());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    ((pid << 45) | (nanos & ((1i64 << 45) - 1))) & i64::MAX
}

impl FileService {
    /// Create a service whose reader ids start from a process- and
    /// time-derived value.
    pub fn new() -> Self {
        let initial = initial_reader_id();
        info!(initial_reader_id = initial, "file service created");
        Self::with_initial_id(initial)
    }

    /// Create a service handing out reader ids from `initial` upwards.
    pub fn with_initial_id(initial: i64) -> Self {
        Self {
            readers: DashMap::new(),
            next_id: AtomicI64::new(initial),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }

    /// Cap the bytes read per request. Larger `count`s are served short,
    /// and the caller continues from `offset + read_size`.
    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: i64) -> Self {
        self.max_chunk_bytes = max_chunk_bytes.max(1);
        self
    }

    /// Register `reader` and return its id, or `-1` if the generated id is
    /// already taken.
    pub fn add_reader(&self, reader: Arc<dyn FileReader>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.readers.entry(id) {
            Entry::Vacant(e) => {
                e.insert(reader);
                id
            }
            Entry::Occupied(_) => -1,
        }
    }

    /// Deregister a reader. Returns whether it was registered.
    pub fn remove_reader(&self, reader_id: i64) -> bool {
        self.readers.remove(&reader_id).is_some()
    }

    /// Number of registered readers.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Serve one byte range of a file from a registered reader. Failures
    /// come back as an error code in the response.
    pub fn handle_get_file(&self, request: &GetFileRequest) -> GetFileResponse {
        if request.count <= 0 || request.offset < 0 {
            return GetFileResponse::error(ErrorResponse::new(
                RaftErrorCode::ERequest,
                format!("invalid request: {request:?}"),
            ));
        }
        let Some(reader) = self.readers.get(&request.reader_id).map(|r| r.value().clone()) else {
            return GetFileResponse::error(ErrorResponse::new(
                RaftErrorCode::ENoEnt,
                format!("fail to find reader={}", request.reader_id),
            ));
        };

        debug!(
            path = %reader.path().display(),
            filename = %request.filename,
            offset = request.offset,
            count = request.count,
            "get file"
        );

        let count = request.count.min(self.max_chunk_bytes);
        let mut buf = BytesMut::new();
        match reader.read_file(&mut buf, &request.filename, request.offset as u64, count as u64) {
            Ok(outcome) => GetFileResponse {
                eof: outcome.eof,
                read_size: outcome.read as i64,
                data: buf.freeze(),
                error_response: None,
            },
            Err(FileReadError::RetryAgain(reason)) => GetFileResponse::error(ErrorResponse::new(
                RaftErrorCode::EAgain,
                format!(
                    "fail to read from path={} filename={} with error: {reason}",
                    reader.path().display(),
                    request.filename
                ),
            )),
            Err(FileReadError::Io(e)) => {
                error!(
                    path = %reader.path().display(),
                    filename = %request.filename,
                    error = %e,
                    "fail to read file"
                );
                GetFileResponse::error(ErrorResponse::new(
                    RaftErrorCode::EIo,
                    format!(
                        "fail to read from path={} filename={}",
                        reader.path().display(),
                        request.filename
                    ),
                ))
            }
        }
    }
}

impl Default for FileService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn service_with_file(contents: &[u8]) -> (FileService, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("snapshot.bin"), contents).unwrap();
        let service = FileService::with_initial_id(100);
        let id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));
        (service, id, dir)
    }

    fn request(reader_id: i64, offset: i64, count: i64) -> GetFileRequest {
        GetFileRequest {
            reader_id,
            filename: "snapshot.bin".into(),
            offset,
            count,
            read_partly: false,
        }
    }

    fn code(resp: &GetFileResponse) -> Option<RaftErrorCode> {
        resp.error_response.as_ref().and_then(ErrorResponse::code)
    }

    #[test]
    fn test_short_file_reports_eof() {
        let (service, id, _dir) = service_with_file(b"hello");
        let resp = service.handle_get_file(&request(id, 0, 10));
        assert!(resp.is_ok());
        assert_eq!(resp.read_size, 5);
        assert!(resp.eof);
        assert_eq!(resp.data.as_ref(), b"hello");
    }

    #[test]
    fn test_chunked_reads() {
        let (service, id, _dir) = service_with_file(b"hello");
        let first = service.handle_get_file(&request(id, 0, 3));
        assert_eq!((first.read_size, first.eof), (3, false));
        assert_eq!(first.data.as_ref(), b"hel");

        let second = service.handle_get_file(&request(id, 3, 3));
        assert_eq!((second.read_size, second.eof), (2, true));
        assert_eq!(second.data.as_ref(), b"lo");

        let past_end = service.handle_get_file(&request(id, 9, 3));
        assert_eq!((past_end.read_size, past_end.eof), (0, true));
        assert!(past_end.data.is_empty());
    }

    #[test]
    fn test_oversized_count_is_served_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("snapshot.bin"), b"0123456789").unwrap();
        let service = FileService::with_initial_id(1).with_max_chunk_bytes(4);
        let id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));

        let first = service.handle_get_file(&request(id, 0, i64::MAX));
        assert_eq!((first.read_size, first.eof), (4, false));
        assert_eq!(first.data.as_ref(), b"0123");

        let last = service.handle_get_file(&request(id, 8, i64::MAX));
        assert_eq!((last.read_size, last.eof), (2, true));
        assert_eq!(last.data.as_ref(), b"89");
    }

    #[test]
    fn test_unknown_reader_is_enoent() {
        let (service, id, _dir) = service_with_file(b"hello");
        let resp = service.handle_get_file(&request(id + 1, 0, 10));
        assert_eq!(code(&resp), Some(RaftErrorCode::ENoEnt));
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_invalid_range_is_erequest() {
        let (service, id, _dir) = service_with_file(b"hello");
        assert_eq!(
            code(&service.handle_get_file(&request(id, 0, 0))),
            Some(RaftErrorCode::ERequest)
        );
        assert_eq!(
            code(&service.handle_get_file(&request(id, -1, 10))),
            Some(RaftErrorCode::ERequest)
        );
    }

    #[test]
    fn test_missing_file_and_escape_are_eio() {
        let (service, id, _dir) = service_with_file(b"hello");
        let mut missing = request(id, 0, 10);
        missing.filename = "nope.bin".into();
        assert_eq!(code(&service.handle_get_file(&missing)), Some(RaftErrorCode::EIo));

        let mut escape = request(id, 0, 10);
        escape.filename = "../snapshot.bin".into();
        assert_eq!(code(&service.handle_get_file(&escape)), Some(RaftErrorCode::EIo));
    }

    struct BusyReader;

    impl FileReader for BusyReader {
        fn path(&self) -> &Path {
            Path::new("busy")
        }

        fn read_file(&self, _: &mut BytesMut, _: &str, _: u64, _: u64) -> Result<ReadOutcome, FileReadError> {
            Err(FileReadError::RetryAgain("snapshot being written".into()))
        }
    }

    #[test]
    fn test_contention_is_eagain() {
        let service = FileService::with_initial_id(1);
        let id = service.add_reader(Arc::new(BusyReader));
        assert_eq!(
            code(&service.handle_get_file(&request(id, 0, 10))),
            Some(RaftErrorCode::EAgain)
        );
    }

    #[test]
    fn test_remove_reader_twice() {
        let (service, id, _dir) = service_with_file(b"hello");
        assert_eq!(service.reader_count(), 1);
        assert!(service.remove_reader(id));
        assert!(!service.remove_reader(id));
        assert_eq!(service.reader_count(), 0);
    }

    #[test]
    fn test_id_collision_returns_minus_one() {
        let service = FileService::with_initial_id(10);
        service.readers.insert(11, Arc::new(BusyReader));
        assert_eq!(service.add_reader(Arc::new(BusyReader)), 10);
        assert_eq!(service.add_reader(Arc::new(BusyReader)), -1);
        assert_eq!(service.add_reader(Arc::new(BusyReader)), 12);
    }

    #[test]
    fn test_generated_ids_are_positive() {
        let service = FileService::new();
        let id = service.add_reader(Arc::new(BusyReader));
        assert!(id >= 0);
    }
}
