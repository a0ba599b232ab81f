use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tar::{EntryType, Header};
use tokio::{
    io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf},
    task::JoinHandle,
};
use tokio_util::io::SyncIoBridge;

use crate::{
    layer::{self, ApplyStats},
    snapshot::{EntryKind, SYMLINK_MODE},
    DlrootfsError, DlrootfsResult,
};

use super::{ChangeEntry, ChangeStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Bytes buffered between the archive writer and the reader.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Mode given to whiteout markers.
const WHITEOUT_MODE: u32 = 0o644;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pin_project! {
    /// A changeset tar archive, written by a background task while it is being read.
    ///
    /// The archive is produced into a bounded pipe, so the reader has to keep draining it
    /// for the writer to make progress. Dropping the stream closes the pipe and the writer
    /// stops with a broken pipe.
    #[derive(Debug)]
    pub struct ChangesetStream {
        #[pin]
        reader: DuplexStream,
        writer: JoinHandle<DlrootfsResult<()>>,
        entries: usize,
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ChangesetStream {
    /// Starts writing `changes`, in order, into a new stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(changes: Vec<ChangeEntry>) -> Self {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let entries = changes.len();
        let bridge = SyncIoBridge::new(writer);

        let writer = tokio::task::spawn_blocking(move || write_changeset(bridge, &changes));

        Self {
            reader,
            writer,
            entries,
        }
    }

    /// Number of archive entries the stream carries.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Drains whatever is left of the stream and waits for the writer, surfacing its error.
    pub async fn finish(self) -> DlrootfsResult<()> {
        let Self {
            mut reader, writer, ..
        } = self;

        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        drop(reader);

        writer.await?
    }

    /// Reads the whole archive into memory.
    pub async fn into_bytes(self) -> DlrootfsResult<Vec<u8>> {
        let Self {
            mut reader, writer, ..
        } = self;

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        drop(reader);

        writer.await??;
        Ok(bytes)
    }

    /// Extracts the archive onto `dest` while it is being written, honoring its whiteouts.
    pub async fn unpack(self, dest: &Path) -> DlrootfsResult<ApplyStats> {
        let Self { reader, writer, .. } = self;

        let applied = layer::apply_archive(reader, dest, "changeset").await;
        let written = writer.await?;

        // When extraction fails first the writer only sees the closed pipe.
        let stats = applied?;
        written?;

        Ok(stats)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes `changes` as a tar archive with normalized ownership and timestamps.
///
/// Blocking.
fn write_changeset<W>(writer: SyncIoBridge<W>, changes: &[ChangeEntry]) -> DlrootfsResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut builder = tar::Builder::new(writer);

    for change in changes {
        append_change(&mut builder, change).map_err(DlrootfsError::ArchiveWrite)?;
    }

    let mut writer = builder.into_inner().map_err(DlrootfsError::ArchiveWrite)?;
    writer.flush().map_err(DlrootfsError::ArchiveWrite)?;
    writer.shutdown().map_err(DlrootfsError::ArchiveWrite)?;

    Ok(())
}

fn append_change<W: Write>(builder: &mut tar::Builder<W>, change: &ChangeEntry) -> io::Result<()> {
    let name = change.archive_name();
    let entry = change.get_entry();

    if *change.get_status() == ChangeStatus::Deleted {
        let mut header = new_header(EntryType::Regular, WHITEOUT_MODE);
        tracing::trace!("changeset: whiteout {name}");
        return builder.append_data(&mut header, &name, io::empty());
    }

    let mode = *entry.get_mode();
    match entry.get_kind() {
        EntryKind::Directory => {
            let mut header = new_header(EntryType::Directory, mode);
            builder.append_data(&mut header, &name, io::empty())
        }
        EntryKind::File { .. } => {
            let source = change.get_source().as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no content for {name}"))
            })?;

            let file = File::open(source)?;
            let size = file.metadata()?.len();

            let mut header = new_header(EntryType::Regular, mode);
            header.set_size(size);
            builder.append_data(&mut header, &name, file.take(size))
        }
        EntryKind::Symlink { target } => {
            let mut header = new_header(EntryType::Symlink, SYMLINK_MODE);
            builder.append_link(&mut header, &name, target)
        }
        EntryKind::Fifo => {
            let mut header = new_header(EntryType::Fifo, mode);
            builder.append_data(&mut header, &name, io::empty())
        }
    }
}

fn new_header(entry_type: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(0);
    header
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AsyncRead for ChangesetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}
