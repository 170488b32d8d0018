// ABOUTME: Single-file tar archives for copying files into and out of containers
// Docker's archive endpoints speak tar; we pack one entry on upload and pick one entry on download

use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::Path;

/// Build an in-memory tar holding `path` with `content`.
///
/// The entry gets the current time as its mtime so the file watcher notices rewrites.
pub fn pack_single_file(path: &str, content: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default());

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, path, content)?;
    builder.into_inner()
}

/// Find the regular-file entry whose name matches the basename of `path` and return its data.
pub fn extract_file(archive: &[u8], path: &str) -> io::Result<Option<Vec<u8>>> {
    let wanted = Path::new(path).file_name().unwrap_or_else(|| OsStr::new(path));
    let mut archive = tar::Archive::new(archive);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry.path()?.file_name() == Some(wanted);
        if matches {
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }

    Ok(None)
}

/// Tar build context containing a single `Dockerfile`
pub fn build_context(dockerfile: &str) -> io::Result<Vec<u8>> {
    pack_single_file("Dockerfile", dockerfile.as_bytes())
}
