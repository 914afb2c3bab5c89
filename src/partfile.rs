//! PartFile (C2): a safe, resumable append channel whose on-disk state is
//! always reconcilable with the Journal via the handshake protocol.

use crate::error::{Error, PartFileError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Which branch of the handshake decision table applied when a PartFile
/// was acquired. Exposed as a type (rather than buried in a branch) so
/// callers — the Engine, tests — can match on it directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// `D == 0`: nothing on disk, append from offset 0.
    Fresh,
    /// `0 < D <= C`: disk agrees with or lags the journal; trust disk,
    /// append from offset `D`.
    ResumeFromDisk,
    /// `C < D < E`, or `E` unknown and `D > C`: a torn write. The tail
    /// `(C, D]` was never acknowledged and may be garbage; truncated to
    /// `C` before the handle is returned.
    TruncateToConfirmed,
    /// `D >= E` (E known): disk claims completion but the journal never
    /// committed. The PartFile is left untouched; the caller must
    /// verify before trusting it (see [`PartFile::verify_ghost`]).
    GhostVerify,
}

/// An open, positioned write handle for one intent's `.part` file.
pub struct PartHandle {
    file: tokio::fs::File,
    part_path: PathBuf,
    target_path: PathBuf,
    position: u64,
}

impl PartHandle {
    /// Current write offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The scratch path this handle writes to.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

/// Namespace for the handshake, append, commit, and abandon operations.
/// Stateless by design — all state lives in the `PartHandle` and on disk.
pub struct PartFile;

impl PartFile {
    /// Run the handshake for `target_path` and return a handle positioned
    /// at the correct resume offset.
    ///
    /// `confirmed_bytes` and `expected_size` come from the Journal's
    /// Intent row; `D` (disk length) is read fresh from the filesystem on
    /// every call, since disk state is never trusted across restarts.
    pub async fn acquire(
        target_path: &Path,
        confirmed_bytes: u64,
        expected_size: Option<u64>,
    ) -> Result<(PartHandle, HandshakeOutcome)> {
        let part_path = part_path_for(target_path);
        let disk_len = match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::PartFile(PartFileError::Io(e))),
        };

        let (outcome, seek_to) = if disk_len == 0 {
            (HandshakeOutcome::Fresh, 0)
        } else if disk_len <= confirmed_bytes {
            (HandshakeOutcome::ResumeFromDisk, disk_len)
        } else if let Some(expected) = expected_size {
            if disk_len < expected {
                (HandshakeOutcome::TruncateToConfirmed, confirmed_bytes)
            } else {
                (HandshakeOutcome::GhostVerify, disk_len)
            }
        } else {
            (HandshakeOutcome::TruncateToConfirmed, confirmed_bytes)
        };

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;

        if outcome == HandshakeOutcome::TruncateToConfirmed {
            file.set_len(seek_to)
                .await
                .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
        }

        file.seek(std::io::SeekFrom::Start(seek_to))
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;

        Ok((
            PartHandle {
                file,
                part_path,
                target_path: target_path.to_path_buf(),
                position: seek_to,
            },
            outcome,
        ))
    }

    /// Append `bytes` at the handle's current position. Bytes are
    /// "unconfirmed" until the next successful `Journal.heartbeat`.
    pub async fn append(handle: &mut PartHandle, bytes: &[u8]) -> Result<()> {
        handle
            .file
            .write_all(bytes)
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
        handle.position += bytes.len() as u64;
        Ok(())
    }

    /// Reposition a handle to `confirmed_bytes`, truncating the file in
    /// place. Used on the `Verifying -> Downloading` digest-mismatch
    /// transition: trust nothing downstream of `confirmed_bytes`.
    pub async fn truncate_to(handle: &mut PartHandle, confirmed_bytes: u64) -> Result<()> {
        handle
            .file
            .set_len(confirmed_bytes)
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
        handle
            .file
            .seek(std::io::SeekFrom::Start(confirmed_bytes))
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
        handle.position = confirmed_bytes;
        Ok(())
    }

    /// Hash the on-disk ghost file and compare to `expected_digest`. If no
    /// digest was recorded at submit time, size equality alone (already
    /// established by the handshake reaching `GhostVerify`) is accepted —
    /// this is the conservative reading of the design's second open
    /// question: require a digest when one is available, fall back to
    /// size-only when it is not.
    pub async fn verify_ghost(handle: &PartHandle, expected_digest: Option<&[u8]>) -> Result<bool> {
        let Some(expected) = expected_digest else {
            return Ok(true);
        };

        let mut file = tokio::fs::File::open(&handle.part_path)
            .await
            .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| Error::PartFile(PartFileError::Io(e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        Ok(digest.as_slice() == expected)
    }

    /// Close the handle, rename `.part -> target_path` atomically, and
    /// return once the rename is durable. Callers MUST call
    /// `Journal.commit` only after this returns `Ok`.
    pub async fn commit(handle: PartHandle) -> Result<()> {
        let PartHandle {
            file,
            part_path,
            target_path,
            ..
        } = handle;
        drop(file);

        tokio::fs::rename(&part_path, &target_path)
            .await
            .map_err(|e| {
                Error::PartFile(PartFileError::RenameFailed {
                    target: target_path.clone(),
                    source: e,
                })
            })?;

        if let Some(parent) = target_path.parent() {
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        Ok(())
    }

    /// Close the handle without renaming. The `.part` file remains for a
    /// future resume. Used on cancellation and preemption.
    pub async fn abandon(handle: PartHandle) -> Result<()> {
        drop(handle.file);
        Ok(())
    }

    /// Delete the `.part` file outright (used by `cancel`, which removes
    /// the Intent row entirely rather than leaving it resumable).
    pub async fn delete(target_path: &Path) -> Result<()> {
        let part_path = part_path_for(target_path);
        match tokio::fs::remove_file(&part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::PartFile(PartFileError::Io(e))),
        }
    }
}

fn part_path_for(target_path: &Path) -> PathBuf {
    let mut os_string = target_path.as_os_str().to_os_string();
    os_string.push(".part");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_start_when_no_part_file_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");

        let (handle, outcome) = PartFile::acquire(&target, 0, Some(100)).await.expect("acquire");
        assert_eq!(outcome, HandshakeOutcome::Fresh);
        assert_eq!(handle.position(), 0);
    }

    #[tokio::test]
    async fn resumes_from_disk_when_disk_lags_or_matches_confirmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![0u8; 4_000_000]).await.expect("seed");

        let (handle, outcome) = PartFile::acquire(&target, 4_000_000, Some(10_000_000))
            .await
            .expect("acquire");
        assert_eq!(outcome, HandshakeOutcome::ResumeFromDisk);
        assert_eq!(handle.position(), 4_000_000);
    }

    #[tokio::test]
    async fn torn_write_is_truncated_to_confirmed_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![0u8; 4_500_000]).await.expect("seed"); // D=4.5M

        let (handle, outcome) = PartFile::acquire(&target, 4_000_000, Some(10_000_000))
            .await
            .expect("acquire");
        assert_eq!(outcome, HandshakeOutcome::TruncateToConfirmed);
        assert_eq!(handle.position(), 4_000_000);
        let meta = tokio::fs::metadata(&part).await.expect("meta");
        assert_eq!(meta.len(), 4_000_000);
    }

    #[tokio::test]
    async fn unknown_expected_size_with_disk_ahead_of_confirmed_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![0u8; 4_500_000]).await.expect("seed");

        let (handle, outcome) = PartFile::acquire(&target, 4_000_000, None)
            .await
            .expect("acquire");
        assert_eq!(outcome, HandshakeOutcome::TruncateToConfirmed);
        assert_eq!(handle.position(), 4_000_000);
    }

    #[tokio::test]
    async fn ghost_file_when_disk_meets_or_exceeds_expected_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![0u8; 5_000_000]).await.expect("seed");

        let (_handle, outcome) = PartFile::acquire(&target, 4_000_000, Some(5_000_000))
            .await
            .expect("acquire");
        assert_eq!(outcome, HandshakeOutcome::GhostVerify);
    }

    #[tokio::test]
    async fn verify_ghost_without_digest_accepts_on_size_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![1u8; 100]).await.expect("seed");

        let (handle, _) = PartFile::acquire(&target, 0, Some(100)).await.expect("acquire");
        assert!(PartFile::verify_ghost(&handle, None).await.expect("verify"));
    }

    #[tokio::test]
    async fn verify_ghost_with_digest_detects_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");
        let part = part_path_for(&target);
        tokio::fs::write(&part, vec![1u8; 100]).await.expect("seed");

        let (handle, _) = PartFile::acquire(&target, 0, Some(100)).await.expect("acquire");
        let wrong_digest = [0u8; 32];
        assert!(!PartFile::verify_ghost(&handle, Some(&wrong_digest)).await.expect("verify"));
    }

    #[tokio::test]
    async fn append_then_commit_renames_part_to_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");

        let (mut handle, _) = PartFile::acquire(&target, 0, Some(5)).await.expect("acquire");
        PartFile::append(&mut handle, b"hello").await.expect("append");
        PartFile::commit(handle).await.expect("commit");

        assert!(target.exists());
        assert!(!part_path_for(&target).exists());
        let contents = tokio::fs::read(&target).await.expect("read");
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn abandon_leaves_part_file_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("song.flac");

        let (mut handle, _) = PartFile::acquire(&target, 0, Some(5)).await.expect("acquire");
        PartFile::append(&mut handle, b"hell").await.expect("append");
        PartFile::abandon(handle).await.expect("abandon");

        let part = part_path_for(&target);
        assert!(part.exists());
        let contents = tokio::fs::read(&part).await.expect("read");
        assert_eq!(contents, b"hell");
    }
}
