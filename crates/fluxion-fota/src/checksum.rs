// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Streaming CRC-32 over image files

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 8 * 1024;

/// CRC-32 (reflected, IEEE polynomial) of a whole file.
///
/// Either the full checksum or the I/O error is returned, never a partial value.
pub fn crc32_file(path: &Path) -> io::Result<u32> {
    let file = File::open(path)?;
    crc32_reader(file)
}

pub fn crc32_reader<R: Read>(mut reader: R) -> io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_vector() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32_reader(&b"123456789"[..]).unwrap(), 0xCBF4_3926);
        assert_eq!(crc32_reader(&b""[..]).unwrap(), 0);
    }

    #[test]
    fn test_file_spanning_multiple_chunks() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(crc32_file(file.path()).unwrap(), crc32fast::hash(&data));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = crc32_file(&dir.path().join("missing.img"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
