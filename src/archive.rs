//! Tar archives for injecting files into a running instance.
//!
//! The builder runs on a blocking thread and pushes fixed-size chunks
//! through a bounded channel, so a large source tree is never held in
//! memory by the builder. Backends that can stream (the CLI backend pipes
//! into `docker cp -`) forward chunks as they arrive.

use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tar::{Builder, EntryType, Header};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 8;

/// Archive compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Content of an in-memory archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file with its bytes.
    File(Vec<u8>),
    /// Directory (header only).
    Directory,
    /// Symlink pointing at the target (header only).
    Symlink(PathBuf),
}

/// One entry of an archive built from memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the extraction root.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Unix permission bits.
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File(content.into()),
            mode: 0o644,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            mode: 0o755,
        }
    }

    pub fn symlink(path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Symlink(target.into()),
            mode: 0o777,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// A tar stream produced by [`ArchiveTransfer`].
pub struct ArchiveStream {
    source: PathBuf,
    compression: Compression,
    inner: ReceiverStream<io::Result<Bytes>>,
}

impl ArchiveStream {
    /// Where the archive was built from (`<memory>` for in-memory entries).
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Drain the stream into one contiguous buffer.
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk.map_err(|e| self.build_error(e))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Wrap an I/O failure from this stream as an archive error.
    pub fn build_error(&self, e: io::Error) -> Error {
        Error::ArchiveBuildFailed {
            path: self.source.clone(),
            reason: e.to_string(),
        }
    }
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("source", &self.source)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Builds archive streams from the filesystem or from memory.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveTransfer {
    compression: Compression,
}

impl ArchiveTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Archive `source`, which may be a file or a directory.
    ///
    /// A directory's contents are stored relative to the directory itself;
    /// a single file is stored under its file name. Symlinks and special
    /// files are stored as headers without content.
    pub fn build(&self, source: impl AsRef<Path>) -> Result<ArchiveStream> {
        let source = source.as_ref().to_path_buf();
        let metadata = fs::symlink_metadata(&source).map_err(|e| Error::ArchiveBuildFailed {
            path: source.clone(),
            reason: e.to_string(),
        })?;

        let walk_root = source.clone();
        Ok(self.spawn(source, move |builder| {
            append_tree(builder, &walk_root, &metadata)
        }))
    }

    /// Archive a list of in-memory entries, in order.
    pub fn from_entries(&self, entries: Vec<ArchiveEntry>) -> ArchiveStream {
        self.spawn(PathBuf::from("<memory>"), move |builder| {
            append_entries(builder, &entries)
        })
    }

    fn spawn<F>(&self, source: PathBuf, fill: F) -> ArchiveStream
    where
        F: FnOnce(&mut Builder<&mut dyn Write>) -> io::Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let compression = self.compression;
        let label = source.display().to_string();

        tokio::task::spawn_blocking(move || {
            let mut sink = ChunkWriter::new(tx.clone());
            if let Err(e) = write_archive(&mut sink, compression, fill) {
                // BrokenPipe means the consumer went away; nobody to tell.
                if e.kind() != io::ErrorKind::BrokenPipe {
                    tracing::debug!(source = %label, error = %e, "archive build failed");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        ArchiveStream {
            source,
            compression,
            inner: ReceiverStream::new(rx),
        }
    }
}

fn write_archive<F>(sink: &mut ChunkWriter, compression: Compression, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut Builder<&mut dyn Write>) -> io::Result<()>,
{
    match compression {
        Compression::None => {
            let mut builder = Builder::new(&mut *sink as &mut dyn Write);
            fill(&mut builder)?;
            builder.finish()?;
            drop(builder);
        }
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(&mut *sink, flate2::Compression::default());
            {
                let mut builder = Builder::new(&mut encoder as &mut dyn Write);
                fill(&mut builder)?;
                builder.finish()?;
            }
            encoder.finish()?;
        }
    }
    sink.flush()
}

fn append_tree(
    builder: &mut Builder<&mut dyn Write>,
    source: &Path,
    metadata: &Metadata,
) -> io::Result<()> {
    builder.follow_symlinks(false);

    if metadata.is_dir() {
        return append_dir_contents(builder, source, Path::new(""));
    }

    let name = source.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "source path has no file name")
    })?;
    append_path(builder, source, Path::new(name), metadata)
}

fn append_dir_contents(
    builder: &mut Builder<&mut dyn Write>,
    dir: &Path,
    relative: &Path,
) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = relative.join(entry.file_name());
        let metadata = fs::symlink_metadata(&path)?;

        append_path(builder, &path, &rel, &metadata)?;
        if metadata.is_dir() {
            append_dir_contents(builder, &path, &rel)?;
        }
    }
    Ok(())
}

fn append_path(
    builder: &mut Builder<&mut dyn Write>,
    path: &Path,
    rel: &Path,
    metadata: &Metadata,
) -> io::Result<()> {
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        builder.append_dir(rel, path)
    } else if file_type.is_file() {
        let mut file = File::open(path)?;
        builder.append_file(rel, &mut file)
    } else if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel, target)
    } else {
        let Some(entry_type) = special_entry_type(metadata) else {
            tracing::debug!(path = %path.display(), "skipping socket, tar cannot represent it");
            return Ok(());
        };
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_entry_type(entry_type);
        header.set_size(0);
        builder.append_data(&mut header, rel, io::empty())
    }
}

#[cfg(unix)]
fn special_entry_type(metadata: &Metadata) -> Option<EntryType> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = metadata.file_type();
    if file_type.is_char_device() {
        Some(EntryType::Char)
    } else if file_type.is_block_device() {
        Some(EntryType::Block)
    } else if file_type.is_fifo() {
        Some(EntryType::Fifo)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn special_entry_type(_metadata: &Metadata) -> Option<EntryType> {
    None
}

fn append_entries(builder: &mut Builder<&mut dyn Write>, entries: &[ArchiveEntry]) -> io::Result<()> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(mtime);

        match &entry.kind {
            EntryKind::File(content) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(content.len() as u64);
                builder.append_data(&mut header, &entry.path, content.as_slice())?;
            }
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
        }
    }
    Ok(())
}

/// `Write` adapter that forwards fixed-size chunks into a channel.
struct ChunkWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: BytesMut,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer dropped"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    fn entry_names(bytes: &[u8]) -> Vec<(String, EntryType)> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().entry_type(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_missing_source_fails_fast() {
        let err = ArchiveTransfer::new()
            .build("/definitely/not/here/tempcontainers")
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveBuildFailed { .. }));
    }

    #[tokio::test]
    async fn test_single_file_uses_file_name() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("init.sql");
        fs::write(&file, "select 1;").unwrap();

        let bytes = ArchiveTransfer::new().build(&file).unwrap().into_bytes().await.unwrap();
        let names = entry_names(&bytes);
        assert_eq!(names, vec![("init.sql".to_string(), EntryType::Regular)]);
    }

    #[tokio::test]
    async fn test_directory_entries_are_relative_and_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b/nested/c.txt"), "c").unwrap();

        let bytes = ArchiveTransfer::new().build(dir.path()).unwrap().into_bytes().await.unwrap();
        let names: Vec<String> = entry_names(&bytes)
            .into_iter()
            .map(|(n, _)| n.trim_end_matches('/').to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b", "b/nested", "b/nested/c.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_header_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "payload").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link.txt")).unwrap();

        let bytes = ArchiveTransfer::new().build(dir.path()).unwrap().into_bytes().await.unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let link = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().ends_with("link.txt"))
            .unwrap();
        assert_eq!(link.header().entry_type(), EntryType::Symlink);
        assert_eq!(link.header().size().unwrap(), 0);
        assert_eq!(
            link.link_name().unwrap().unwrap().to_string_lossy(),
            "real.txt"
        );
    }

    #[tokio::test]
    async fn test_from_entries_with_gzip() {
        let stream = ArchiveTransfer::new()
            .with_compression(Compression::Gzip)
            .from_entries(vec![
                ArchiveEntry::directory("scripts"),
                ArchiveEntry::file("scripts/run.sh", "#!/bin/sh\necho hi\n").with_mode(0o755),
            ]);
        assert_eq!(stream.compression(), Compression::Gzip);
        assert_eq!(stream.source(), Path::new("<memory>"));

        let bytes = stream.into_bytes().await.unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&bytes[..])
            .read_to_end(&mut decoded)
            .unwrap();

        let mut archive = tar::Archive::new(&decoded[..]);
        let mut entries = archive.entries().unwrap();

        let dir = entries.next().unwrap().unwrap();
        assert_eq!(dir.header().entry_type(), EntryType::Directory);

        let mut script = entries.next().unwrap().unwrap();
        assert_eq!(script.header().mode().unwrap(), 0o755);
        let mut content = String::new();
        script.read_to_string(&mut content).unwrap();
        assert_eq!(content, "#!/bin/sh\necho hi\n");
    }

    #[tokio::test]
    async fn test_large_file_spans_multiple_chunks() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; CHUNK_SIZE * 3 + 17];
        fs::write(dir.path().join("blob.bin"), &data).unwrap();

        let mut stream = ArchiveTransfer::new().build(dir.path()).unwrap();
        let mut chunks = 0;
        let mut total = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks += 1;
            total.extend_from_slice(&chunk.unwrap());
        }
        assert!(chunks > 1);

        let mut archive = tar::Archive::new(&total[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut read_back = Vec::new();
        entry.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, data);
    }
}
