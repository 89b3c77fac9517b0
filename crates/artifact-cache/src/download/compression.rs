use std::io::{self, Read, Seek};
use std::path::Path;

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use tempfile::NamedTempFile;

/// A compression layer detected from the leading bytes of a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    Zstd,
    Gzip,
    Zlib,
}

impl Compression {
    fn detect(magic: [u8; 4]) -> Option<Self> {
        match magic {
            [0x28, 0xb5, 0x2f, 0xfd] => Some(Self::Zstd),
            [0x1f, 0x8b, _, _] => Some(Self::Gzip),
            [0x78, 0x01 | 0x9c | 0xda, _, _] => Some(Self::Zlib),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        }
    }
}

/// Replaces `src` with its decompressed contents if it is zstd, gzip or zlib compressed.
///
/// The decompressed file is a new temp file in the same directory. Anything else, including
/// zip and tar archives, is left as is for the reader.
pub fn maybe_decompress_file(src: &mut NamedTempFile) -> io::Result<()> {
    let mut file = src.as_file();
    file.sync_all()?;
    file.rewind()?;

    let mut magic = [0u8; 4];
    let compression = match file.read_exact(&mut magic) {
        Ok(()) => Compression::detect(magic),
        // shorter than any magic
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
        Err(e) => return Err(e),
    };
    file.rewind()?;

    let Some(compression) = compression else {
        return Ok(());
    };
    tracing::trace!(compression = compression.name(), "Decompressing artifact");

    let mut dst = tempfile_in_parent(src.path())?;
    match compression {
        Compression::Zstd => zstd::stream::copy_decode(file, &mut dst)?,
        // concatenated gzip members decode as one stream
        Compression::Gzip => {
            io::copy(&mut MultiGzDecoder::new(file), &mut dst)?;
        }
        Compression::Zlib => {
            io::copy(&mut ZlibDecoder::new(file), &mut dst)?;
        }
    }

    std::mem::swap(src, &mut dst);
    Ok(())
}

/// Creates a temp file next to `path`, so it can later be renamed over `path` atomically.
pub fn tempfile_in_parent(path: &Path) -> io::Result<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
    tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression as GzCompression;
    use flate2::write::ZlibEncoder;

    use super::*;

    fn temp_file_with(dir: &Path, contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new_in(dir).unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_gzip_fixture() {
        let dir = artifact_cache_test::tempdir();
        let gz = artifact_cache_test::read_fixture("artifacts/hello.txt.gz");
        let mut file = temp_file_with(dir.path(), &gz);
        let original = file.path().to_owned();

        maybe_decompress_file(&mut file).unwrap();

        assert_ne!(file.path(), original);
        assert_eq!(file.path().parent(), Some(dir.path()));
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_zstd() {
        let dir = artifact_cache_test::tempdir();
        let compressed = zstd::encode_all(&b"zstd compressed artifact"[..], 3).unwrap();
        let mut file = temp_file_with(dir.path(), &compressed);

        maybe_decompress_file(&mut file).unwrap();
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            b"zstd compressed artifact"
        );
    }

    #[test]
    fn test_zlib() {
        let dir = artifact_cache_test::tempdir();
        let mut encoder = ZlibEncoder::new(Vec::new(), GzCompression::default());
        encoder.write_all(b"zlib compressed artifact").unwrap();
        let mut file = temp_file_with(dir.path(), &encoder.finish().unwrap());

        maybe_decompress_file(&mut file).unwrap();
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            b"zlib compressed artifact"
        );
    }

    #[test]
    fn test_zip_is_kept() {
        let dir = artifact_cache_test::tempdir();
        let bundle = artifact_cache_test::read_fixture("artifacts/bundle.zip");
        let mut file = temp_file_with(dir.path(), &bundle);
        let original = file.path().to_owned();

        maybe_decompress_file(&mut file).unwrap();
        assert_eq!(file.path(), original);
        assert_eq!(std::fs::read(file.path()).unwrap(), bundle);
    }

    #[test]
    fn test_plain_and_tiny_files() {
        let dir = artifact_cache_test::tempdir();
        for contents in [&b""[..], &b"ab"[..], &b"plain text"[..]] {
            let mut file = temp_file_with(dir.path(), contents);
            maybe_decompress_file(&mut file).unwrap();
            assert_eq!(std::fs::read(file.path()).unwrap(), contents);
        }
    }

    #[test]
    fn test_tgz_leaves_tar() {
        let dir = artifact_cache_test::tempdir();
        let tgz = artifact_cache_test::read_fixture("artifacts/bundle.tgz");
        let mut file = temp_file_with(dir.path(), &tgz);

        maybe_decompress_file(&mut file).unwrap();
        let tar = std::fs::read(file.path()).unwrap();
        assert_eq!(&tar[257..262], b"ustar");
    }

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect([0x1f, 0x8b, 0x08, 0x00]), Some(Compression::Gzip));
        assert_eq!(Compression::detect([0x78, 0x9c, 0x00, 0x00]), Some(Compression::Zlib));
        assert_eq!(Compression::detect([0x28, 0xb5, 0x2f, 0xfd]), Some(Compression::Zstd));
        assert_eq!(Compression::detect([0x50, 0x4b, 0x03, 0x04]), None);
        assert_eq!(Compression::detect(*b"plai"), None);
    }

    #[test]
    fn test_truncated_gzip() {
        let dir = artifact_cache_test::tempdir();
        let gz = artifact_cache_test::read_fixture("artifacts/hello.txt.gz");
        let mut file = temp_file_with(dir.path(), &gz[..gz.len() / 2]);

        assert!(maybe_decompress_file(&mut file).is_err());
    }
}
