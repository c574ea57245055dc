use std::io;
use std::path::Path;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;

/// Packs the contents of `dir` into a gzip-compressed tar archive
///
/// Entries are stored relative to `dir`, so unpacking the archive at a
/// destination places the bundle's files directly inside it.
pub fn pack_directory(dir: &Path) -> io::Result<Bytes> {
    let metadata = std::fs::metadata(dir).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("submission bundle {} is not readable: {e}", dir.display()),
        )
    })?;
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("submission bundle {} is not a directory", dir.display()),
        ));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", dir)?;

    let compressed = archive.into_inner()?.finish()?;
    log::debug!(
        "Packed bundle {} into {} bytes",
        dir.display(),
        compressed.len()
    );
    Ok(Bytes::from(compressed))
}

/// Runs [`pack_directory`] on the blocking pool
pub async fn pack_directory_blocking(dir: &Path) -> io::Result<Bytes> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || pack_directory(&dir))
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use pretty_assertions::assert_eq;

    use super::*;

    fn unpack(archive: &[u8]) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        let mut archive = tar::Archive::new(GzDecoder::new(archive));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            files.insert(path.trim_start_matches("./").to_string(), content);
        }
        files
    }

    #[test]
    fn test_pack_keeps_relative_layout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("handin.c"), "int main() { return 0; }\n").unwrap();
        fs::create_dir(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests").join("case1.in"), "1 2\n").unwrap();

        let archive = pack_directory(dir.path()).unwrap();
        let files = unpack(&archive);

        assert_eq!(
            files,
            BTreeMap::from([
                ("handin.c".to_string(), "int main() { return 0; }\n".to_string()),
                ("tests/case1.in".to_string(), "1 2\n".to_string()),
            ])
        );
    }

    #[test]
    fn test_missing_bundle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = pack_directory(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_bundle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("handin.c");
        fs::write(&file, "x").unwrap();
        let err = pack_directory(&file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_pack_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        let archive = pack_directory_blocking(dir.path()).await.unwrap();
        assert!(unpack(&archive).contains_key("Makefile"));
    }
}
