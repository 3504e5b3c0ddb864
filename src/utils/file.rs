use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::info;
use regex::Regex;

lazy_static! {
    static ref FASTQ_EXT_RE: Regex = Regex::new(r"^(.*).((fq)|(fastq))(.gz)?").unwrap();
}


/// Makes `path` absolute by joining it onto `cwd` when relative.
pub fn resolve_path<P: AsRef<Path>>(path: P, cwd: &Path) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}


/// Strips the FASTQ extension (and optional .gz) from the file name of `path`.
/// trim_galore names its outputs from this root.
///
/// # Arguments
///
/// * `path` - Path to a FASTQ file.
///
/// # Returns
/// File name with the extension removed; the bare file name if nothing matched.
pub fn fastq_root(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    FASTQ_EXT_RE.replace(&file_name, "${1}").into_owned()
}


/// True when every path is an existing regular file. Empty input is false.
pub fn all_exist<P: AsRef<Path>>(paths: &[P]) -> bool {
    !paths.is_empty() && paths.iter().all(|p| p.as_ref().is_file())
}


/// Deletes `path` if it is a file.
///
/// # Returns
/// true if a file was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    if path.is_file() {
        info!("removing {}", path.display());
        fs::remove_file(path)?;
        Ok(true)
    } else {
        info!("File {} does not exist to delete. Skipping.", path.display());
        Ok(false)
    }
}


pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fastq_root() {
        assert_eq!(fastq_root(Path::new("/data/S1_R1.fastq.gz")), "S1_R1");
        assert_eq!(fastq_root(Path::new("S1_R2.fq.gz")), "S1_R2");
        assert_eq!(fastq_root(Path::new("lane1.fq")), "lane1");
        assert_eq!(fastq_root(Path::new("reads/sample.1.fastq")), "sample.1");
        assert_eq!(fastq_root(Path::new("reads.txt")), "reads.txt");
    }

    #[test]
    fn test_resolve_path() {
        let cwd = Path::new("/work");
        assert_eq!(resolve_path("a/b.fq", cwd), PathBuf::from("/work/a/b.fq"));
        assert_eq!(resolve_path("/abs/b.fq", cwd), PathBuf::from("/abs/b.fq"));
    }

    #[test]
    fn test_all_exist_and_remove() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let b = dir.path().join("b.bam");
        fs::write(&a, b"a").unwrap();
        assert!(all_exist(&[&a]));
        assert!(!all_exist(&[&a, &b]));
        assert!(!all_exist::<&Path>(&[]));

        assert!(remove_if_exists(&a).unwrap());
        assert!(!a.exists());
        assert!(!remove_if_exists(&a).unwrap());
    }

    #[test]
    fn test_is_gzipped() {
        let dir = tempdir().unwrap();
        let gz = dir.path().join("r1.fq.gz");
        let plain = dir.path().join("r1.fq");
        let empty = dir.path().join("empty.fq");
        fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00]).unwrap();
        fs::write(&plain, b"@r1\nACGT\n+\nIIII\n").unwrap();
        fs::write(&empty, b"").unwrap();
        assert!(is_gzipped(&gz).unwrap());
        assert!(!is_gzipped(&plain).unwrap());
        assert!(!is_gzipped(&empty).unwrap());
    }
}
