use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;
use crate::piece::PieceResult;

/// Persists finished pieces at `index * piece_len` in a pre-sized file.
pub struct FileWriter {
    path: PathBuf,
    file: File,
    piece_len: u32,
}

impl FileWriter {
    /// Creates (or truncates) `path` and sizes it to `file_len` bytes.
    pub async fn create(path: &Path, file_len: u64, piece_len: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(file_len).await?;

        Ok(FileWriter {
            path: path.to_path_buf(),
            file,
            piece_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, res: &PieceResult) -> Result<()> {
        let begin = res.index as u64 * self.piece_len as u64;
        self.file.seek(SeekFrom::Start(begin)).await?;
        self.file.write_all(&res.buf).await?;
        Ok(())
    }

    /// Flushes buffered data and syncs it to disk.
    pub async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = FileWriter::create(&path, 1000, 256).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 1000);
        assert_eq!(writer.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, vec![0xaa; 100]).await.unwrap();

        let mut writer = FileWriter::create(&path, 10, 4).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0u8; 10]);
    }

    #[tokio::test]
    async fn test_out_of_order_writes_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let piece_len = 16u32;
        let file_len = 56u64;

        let mut writer = FileWriter::create(&path, file_len, piece_len).await.unwrap();
        // the last piece is short
        for index in [3u32, 0, 2, 1] {
            let len = crate::piece::piece_size(index, piece_len, file_len) as usize;
            let res = PieceResult {
                index,
                buf: vec![index as u8 + 1; len],
            };
            writer.write(&res).await.unwrap();
        }
        writer.finish().await.unwrap();

        let mut expected = Vec::new();
        for index in 0..4u8 {
            let len = crate::piece::piece_size(index as u32, piece_len, file_len) as usize;
            expected.extend(vec![index + 1; len]);
        }
        assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.bin");

        assert!(matches!(
            FileWriter::create(&path, 10, 4).await,
            Err(crate::error::Error::Io(_))
        ));
    }
}
