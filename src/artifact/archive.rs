//! Deterministic tar + zstd archives.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Archive the contents of `src_dir` (not the directory itself) into
/// `out_path` as a zstd-compressed tar.
///
/// Entries are sorted and carry zeroed mtime/uid/gid so identical trees give
/// identical archives. `workers > 0` enables multi-threaded compression.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path, level: i32, workers: u32) -> io::Result<()> {
    let out = File::create(out_path)?;
    let mut encoder = zstd::stream::Encoder::new(out, level)?;
    if workers > 0 {
        encoder.multithread(workers)?;
    }
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.map_err(io::Error::from)?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.into_path());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a);
        let rb = b.strip_prefix(src_dir).unwrap_or(b);
        ra.cmp(rb)
    });

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode());
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else if md.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            let mut f = File::open(&p)?;
            builder.append_data(&mut header, &rel, &mut f)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}
