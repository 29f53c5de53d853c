// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Firmware Upgrader.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! SHA256 checksums of firmware images

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Hex encoded SHA256 of a file, hashed in a streaming fashion
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn sha256_file_async(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(io::Error::other)?
}

pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_bytes(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[tokio::test]
    async fn test_file_digest_matches_bytes() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"firmware image").unwrap();

        let digest = sha256_file_async(file.path().to_path_buf()).await.unwrap();
        assert_eq!(digest, sha256_bytes(b"firmware image"));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_missing_file() {
        assert!(sha256_file(Path::new("/nonexistent/image.bin")).is_err());
    }
}
