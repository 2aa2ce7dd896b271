//! Decompression Module
//!
//! This module turns a raw attachment into plain XML bytes. The container is
//! detected from the leading magic bytes only: ZIP archives yield their first
//! file entry, GZIP streams are inflated fully (every member of a
//! multi-member stream), and anything else is passed
//! through untouched. Output is capped by `max_decompressed_size` and inflation
//! stops as soon as the cap is crossed.
use std::io::{Cursor, Read};
use flate2::read::MultiGzDecoder;
use zip::ZipArchive;
use crate::config::Config;
use crate::error::{DmarcError, Result};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_LOCAL_HEADER: &[u8] = &[0x50, 0x4b, 0x03, 0x04];
// An archive without entries consists of the end-of-central-directory record alone.
const ZIP_EMPTY_ARCHIVE: &[u8] = &[0x50, 0x4b, 0x05, 0x06];

/// Container kinds recognised by magic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Zip,
    Gzip,
    Plain,
}

/// Classifies `bytes` by their leading magic bytes.
pub fn sniff(bytes: &[u8]) -> Container {
    if bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE) {
        Container::Zip
    } else if bytes.starts_with(GZIP_MAGIC) {
        Container::Gzip
    } else {
        Container::Plain
    }
}

/// Returns the XML payload of `bytes`, unwrapping a ZIP or GZIP container if present.
///
/// # Errors
///
/// - `UnsupportedContainer` if a ZIP archive holds no file entries.
/// - `CorruptArchive` if the archive or stream cannot be read.
/// - `SizeExceeded` if the inflated payload would exceed `config.max_decompressed_size`,
///   or a ZIP entry declares a suspicious compression ratio.
pub fn decompress(bytes: &[u8], config: &Config) -> Result<Vec<u8>> {
    match sniff(bytes) {
        Container::Zip => unzip_first_entry(bytes, config),
        Container::Gzip => gunzip(bytes, config),
        Container::Plain => Ok(bytes.to_vec()),
    }
}

fn unzip_first_entry(bytes: &[u8], config: &Config) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
    let index = (0..archive.len())
        .find(|&i| archive.by_index_raw(i).map(|f| f.is_file()).unwrap_or(false))
        .ok_or_else(|| DmarcError::UnsupportedContainer("ZIP archive contains no entries".into()))?;
    let entry = archive
        .by_index(index)
        .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
    let compressed_size = entry.compressed_size();
    let uncompressed_size = entry.size();
    if uncompressed_size > config.max_decompressed_size as u64 {
        return Err(DmarcError::SizeExceeded(format!(
            "ZIP entry {} declares {} bytes (limit {})",
            entry.name(),
            uncompressed_size,
            config.max_decompressed_size
        )));
    }
    if compressed_size > 0 {
        let compression_ratio = uncompressed_size as f64 / compressed_size as f64;
        if compression_ratio > config.max_compression_ratio {
            return Err(DmarcError::SizeExceeded(format!(
                "Suspicious compression ratio: {:.2}",
                compression_ratio
            )));
        }
    }
    read_capped(entry, config.max_decompressed_size)
}

fn gunzip(bytes: &[u8], config: &Config) -> Result<Vec<u8>> {
    read_capped(MultiGzDecoder::new(bytes), config.max_decompressed_size)
}

/// Reads at most `limit` bytes; one byte more means the payload is over the ceiling.
fn read_capped<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
    if out.len() > limit {
        return Err(DmarcError::SizeExceeded(format!(
            "Decompressed size exceeds limit of {} bytes",
            limit
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::PathBuf;
    use zip::write::SimpleFileOptions;

    const XML: &[u8] = b"<feedback><report_metadata/></feedback>";

    fn config(max_decompressed_size: usize) -> Config {
        Config {
            max_file_size: 1024 * 1024,
            max_decompressed_size,
            max_compression_ratio: 1000.0,
            database_path: PathBuf::from("unused.sqlite"),
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(data).unwrap();
        gz.finish().unwrap()
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_plain_passthrough() {
        assert_eq!(sniff(XML), Container::Plain);
        assert_eq!(decompress(XML, &config(1024)).unwrap(), XML);
    }

    #[test]
    fn test_gzip_inflates() {
        let packed = gzip(XML);
        assert_eq!(sniff(&packed), Container::Gzip);
        assert_eq!(decompress(&packed, &config(1024)).unwrap(), XML);
    }

    #[test]
    fn test_gzip_reads_every_member() {
        let mut packed = gzip(b"<feedback>");
        packed.extend(gzip(b"<report_metadata/></feedback>"));
        assert_eq!(decompress(&packed, &config(1024)).unwrap(), XML);
    }

    #[test]
    fn test_zip_yields_first_entry() {
        let packed = zip_with(&[("report.xml", XML), ("second.xml", b"<other/>")]);
        assert_eq!(sniff(&packed), Container::Zip);
        assert_eq!(decompress(&packed, &config(1024)).unwrap(), XML);
    }

    #[test]
    fn test_empty_zip_is_unsupported() {
        let packed = zip_with(&[]);
        let result = decompress(&packed, &config(1024));
        assert!(matches!(result, Err(DmarcError::UnsupportedContainer(_))));
    }

    #[test]
    fn test_truncated_gzip_is_corrupt() {
        let packed = gzip(&XML.repeat(50));
        let result = decompress(&packed[..packed.len() / 2], &config(1024 * 1024));
        assert!(matches!(result, Err(DmarcError::CorruptArchive(_))));
    }

    #[test]
    fn test_gzip_over_ceiling() {
        let packed = gzip(&vec![b'A'; 4096]);
        let result = decompress(&packed, &config(1024));
        assert!(matches!(result, Err(DmarcError::SizeExceeded(_))));
    }

    #[test]
    fn test_truncated_zip_is_corrupt() {
        let packed = zip_with(&[("report.xml", XML)]);
        let result = decompress(&packed[..20], &config(1024));
        assert!(matches!(result, Err(DmarcError::CorruptArchive(_))));
    }
}
