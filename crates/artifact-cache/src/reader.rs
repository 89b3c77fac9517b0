//! Serving single members out of materialized artifacts.
//!
//! An artifact materialized at a local path can take four shapes:
//!
//! - A directory: members are files below that directory.
//! - A zip archive: members are the archive's entries, addressed by their full name.
//! - A tar archive: members are regular file entries, addressed by their path. A leading `./`
//!   is ignored on both sides. Compressed tarballs (`.tgz`) arrive here already decompressed.
//! - Any other file: the artifact has exactly one member, the file itself. It is addressed by
//!   the empty name or by the file name of the local path.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;

use crate::error::ReadError;

/// Magic bytes of a zip local file header.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// The `ustar` magic of POSIX and GNU tar headers, and its offset in the first header.
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Upper bound for preallocating member buffers from (untrusted) archive headers.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Returns a single member of a materialized artifact.
///
/// Readers are only invoked while the caller holds the entry's lock, so implementations
/// need no locking of their own.
pub trait Reader: Send + Sync + 'static {
    fn read<'a>(
        &'a self,
        local_path: &'a Path,
        member: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, ReadError>>;
}

/// The default [`Reader`], see the [module docs](self) for the supported layouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactReader;

impl ArtifactReader {
    pub fn new() -> Self {
        Self
    }
}

impl Reader for ArtifactReader {
    fn read<'a>(
        &'a self,
        local_path: &'a Path,
        member: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, ReadError>> {
        Box::pin(read_member(local_path, member))
    }
}

async fn read_member(local_path: &Path, member: &str) -> Result<Bytes, ReadError> {
    let metadata = tokio::fs::metadata(local_path).await?;

    if metadata.is_dir() {
        let relative = member_path(member)?;
        return match tokio::fs::read(local_path.join(relative)).await {
            Ok(contents) => Ok(contents.into()),
            Err(e) if is_missing(&e) => Err(ReadError::MemberNotFound(member.to_owned())),
            Err(e) => Err(e.into()),
        };
    }

    let format = ArchiveFormat::sniff(local_path).await?;
    if format != ArchiveFormat::Plain {
        let relative = member_path(member)?;
        let path = local_path.to_owned();
        let member = member.to_owned();
        return tokio::task::spawn_blocking(move || match format {
            ArchiveFormat::Zip => read_zip_member(&path, &member),
            _ => read_tar_member(&path, &relative, &member),
        })
        .await
        .map_err(|e| ReadError::Io(io::Error::other(e)))?;
    }

    let file_name = local_path.file_name().and_then(|name| name.to_str());
    if member.is_empty() || file_name == Some(member) {
        Ok(tokio::fs::read(local_path).await?.into())
    } else {
        Err(ReadError::MemberNotFound(member.to_owned()))
    }
}

/// Validates a member name and turns it into a relative path.
fn member_path(member: &str) -> Result<PathBuf, ReadError> {
    let mut path = PathBuf::new();
    for component in Path::new(member).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ReadError::InvalidMember(member.to_owned()));
            }
        }
    }

    if path.as_os_str().is_empty() {
        return Err(ReadError::InvalidMember(member.to_owned()));
    }
    Ok(path)
}

fn is_missing(e: &io::Error) -> bool {
    // reading a directory as a file yields `IsADirectory` on some platforms
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::IsADirectory
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    Tar,
    Plain,
}

impl ArchiveFormat {
    /// Detects the format from the leading bytes of the file at `path`.
    async fn sniff(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + TAR_MAGIC.len());
        file.take((TAR_MAGIC_OFFSET + TAR_MAGIC.len()) as u64)
            .read_to_end(&mut header)
            .await?;

        if header.starts_with(&ZIP_MAGIC) {
            Ok(Self::Zip)
        } else if header.get(TAR_MAGIC_OFFSET..) == Some(TAR_MAGIC) {
            Ok(Self::Tar)
        } else {
            Ok(Self::Plain)
        }
    }
}

fn read_zip_member(path: &Path, member: &str) -> Result<Bytes, ReadError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let name = member.trim_start_matches("./");
    let mut zip_file = match archive.by_name(name) {
        Ok(zip_file) => zip_file,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ReadError::MemberNotFound(member.to_owned()));
        }
        Err(e) => return Err(e.into()),
    };
    if zip_file.is_dir() {
        return Err(ReadError::MemberNotFound(member.to_owned()));
    }

    let mut contents = Vec::with_capacity(zip_file.size().min(MAX_PREALLOCATION) as usize);
    zip_file.read_to_end(&mut contents)?;
    Ok(contents.into())
}

fn read_tar_member(path: &Path, relative: &Path, member: &str) -> Result<Bytes, ReadError> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        // `member_path` drops `.` components, so `./a` and `a` compare equal
        let Ok(entry_path) = member_path(&entry.path()?.to_string_lossy()) else {
            continue;
        };
        if entry_path == relative {
            let mut contents = Vec::with_capacity(entry.size().min(MAX_PREALLOCATION) as usize);
            entry.read_to_end(&mut contents)?;
            return Ok(contents.into());
        }
    }

    Err(ReadError::MemberNotFound(member.to_owned()))
}
