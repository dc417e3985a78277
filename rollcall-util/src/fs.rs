use std::fs;
use std::io::{self, Write};
use std::path::Path;

use super::random::{ALPHA_NUM, pseudorandom_string};

/// Extension prefix used by in-progress writes. Files carrying it are
/// leftovers from an interrupted [`safe_write_all`] and never valid documents.
pub const TMP_EXT_PREFIX: &str = "sync-";

/// Atomically creates a file with the given contents, overwriting
/// it if one exists.
///
/// This function will first write the buffer into a new file that
/// resides in the same directory as the desired file and then do
/// the complete sync/rename dance to ensure the buffer is safely
/// written to disk. If this function returns successfully, you can
/// be reasonably sure the write completed durably. If it fails, the
/// previous contents of `path` (if any) are left untouched.
///
/// Read: [Ensuring data reaches to disk](https://lwn.net/Articles/457667/).
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    // create temp file
    let tmp_ext = TMP_EXT_PREFIX.to_owned() + &pseudorandom_string(ALPHA_NUM, 6);
    let tmp_path = path.as_ref().with_extension(tmp_ext);
    let mut tmp_file = fs::File::create(tmp_path.clone())?;

    // write given contents and sync to disk
    let res = tmp_file
        .write_all(buf.as_ref())
        .and_then(|_| tmp_file.flush())
        .and_then(|_| tmp_file.sync_all());
    drop(tmp_file);
    if let Err(err) = res {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    // rename tmp file to destination
    fs::rename(&tmp_path, path.as_ref())?;

    // sync the parent so the rename itself survives a power loss
    if let Some(parent) = path.as_ref().parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
