//! Raw byte dumps of a region, for offline disassembly.
//!
//! Dumping only reads. A failed dump is reported as [`JitError::Dump`] and
//! leaves the region exactly as it was.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use log::debug;

use crate::error::{JitError, Result};
use crate::region::MemoryRegion;

/// Write the first `len` bytes of `region` to `out`. `len` is clamped to the
/// region size. Returns the number of bytes written.
pub fn dump_to_writer<W: Write>(region: &MemoryRegion, len: usize, out: &mut W) -> Result<usize> {
    let bytes = region.bytes()?;
    let len = len.min(bytes.len());
    write_all(out, &bytes[..len]).map_err(|source| JitError::Dump {
        region: region.id(),
        target: "<writer>".to_string(),
        source,
    })?;
    Ok(len)
}

/// Create (or truncate) `path` and write the first `len` bytes of `region`.
pub fn dump_to_path(region: &MemoryRegion, len: usize, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let bytes = region.bytes()?;
    let len = len.min(bytes.len());
    File::create(path)
        .and_then(|mut file| write_all(&mut file, &bytes[..len]))
        .map_err(|source| JitError::Dump {
            region: region.id(),
            target: path.display().to_string(),
            source,
        })?;
    debug!("region {}: dumped {} bytes to {}", region.id(), len, path.display());
    Ok(len)
}

fn write_all<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Permission;
    use crate::strategy::Strategy;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_dump_to_writer_clamps_len() {
        let mut region = Strategy::WriteXorExecute.allocate(64).unwrap();
        region.write_into([0xC3u8], 0).unwrap();

        let mut out = Vec::new();
        assert_eq!(dump_to_writer(&region, 1, &mut out).unwrap(), 1);
        assert_eq!(out, [0xC3]);

        let mut out = Vec::new();
        let n = dump_to_writer(&region, usize::MAX, &mut out).unwrap();
        assert_eq!(n, region.size());
    }

    #[test]
    fn test_dump_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jitout.bin");
        let mut region = Strategy::WriteXorExecute.allocate(64).unwrap();
        region.write_into([0x48u8, 0x89, 0xf8, 0xc3], 0).unwrap();
        region.protect(Permission::ReadExecute).unwrap();

        assert_eq!(dump_to_path(&region, 4, &path).unwrap(), 4);
        assert_eq!(std::fs::read(&path).unwrap(), [0x48, 0x89, 0xf8, 0xc3]);
    }

    #[test]
    fn test_failed_dump_leaves_region_intact() {
        let mut region = Strategy::WriteXorExecute.allocate(64).unwrap();
        region.write_into([0x90u8, 0xc3], 0).unwrap();

        let err = dump_to_writer(&region, 2, &mut FailingWriter).unwrap_err();
        assert!(matches!(err, JitError::Dump { .. }));
        assert_eq!(region.permission(), Permission::ReadWrite);
        assert_eq!(&region.bytes().unwrap()[..2], &[0x90, 0xc3]);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/out.bin");
        assert!(matches!(
            dump_to_path(&region, 2, missing),
            Err(JitError::Dump { .. })
        ));
    }
}
