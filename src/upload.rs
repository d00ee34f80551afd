//! Chunked file upload.
//!
//! The file is read twice: once for the checksum, once to stream its
//! content. Between the two the metadata record is persisted so the raw
//! file store has an id to write against.

use std::path::{Path, PathBuf};

use tokio::fs::File;

use crate::checksum::{self, BLOCK_SIZE};
use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::model::{downcast, Format, OriginalFile};
use crate::proxy::RawFileStorePrx;

/// Optional inputs to [`Client::upload`].
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Display name; defaults to the file's base name.
    pub name: Option<String>,
    /// Remote path; defaults to the absolute local path.
    pub path: Option<String>,
    /// Format tag used when the record carries none.
    pub format: Option<String>,
    /// Existing record to update instead of a fresh draft.
    pub file: Option<OriginalFile>,
}

impl UploadOptions {
    pub fn format(format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_file(mut self, file: OriginalFile) -> Self {
        self.file = Some(file);
        self
    }
}

/// Fill in the record for `path`. Size and checksum always come from the
/// local file; everything else only where the record leaves a gap.
fn prepare_record(
    path: &Path,
    size: u64,
    checksum: String,
    options: UploadOptions,
) -> Result<OriginalFile> {
    let mut file = options.file.unwrap_or_default();
    file.size = Some(size);
    file.checksum = Some(checksum);

    if file.name.is_none() {
        file.name = Some(options.name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned())
        }));
    }

    if file.path.is_none() {
        let remote = match options.path {
            Some(p) => p,
            None => std::path::absolute(path)?.to_string_lossy().into_owned(),
        };
        file.path = Some(remote);
    }

    if file.format.is_none() {
        // Never guess the format from the file name.
        let format = options
            .format
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ClientError::Configuration("no format given".into()))?;
        file.format = Some(Format::new(format));
    }

    Ok(file)
}

/// Stream `file` to `store` in [`BLOCK_SIZE`] chunks. Returns bytes written.
async fn write_chunks(store: &RawFileStorePrx, id: i64, file: &mut File) -> Result<u64> {
    store.set_file_id(id).await?;

    let mut offset = 0u64;
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = checksum::read_block(file, &mut buf).await?;
        if n == 0 {
            break;
        }
        store.write(offset, &buf[..n]).await?;
        offset += n as u64;
    }

    Ok(offset)
}

impl Client {
    /// Upload the file at `filename` and return the persisted record.
    ///
    /// A failure after the record was saved leaves partial remote content
    /// behind; callers retry or clean up themselves.
    pub async fn upload(&self, filename: impl AsRef<Path>, options: UploadOptions) -> Result<OriginalFile> {
        let session = self
            .session()
            .ok_or_else(|| ClientError::session("No session. Use create_session first."))?;

        let path: PathBuf = filename.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ClientError::NotFound(path));
        }

        let size = tokio::fs::metadata(&path).await?.len();
        let digest = checksum::checksum_file(&path).await?;
        let draft = prepare_record(&path, size, digest, options)?;

        tracing::debug!(
            "saving record for {} ({} bytes, checksum {})",
            path.display(),
            size,
            draft.checksum.as_deref().unwrap_or_default()
        );
        let update = session.get_update_service().await?;
        let saved = downcast::<OriginalFile>(update.save_and_return_object(&draft).await?)?;
        let id = saved
            .id
            .ok_or_else(|| ClientError::Protocol("saved file has no identifier".into()))?;

        let mut file = File::open(&path).await?;
        let store = session.create_raw_file_store().await?;

        let written = write_chunks(&store, id, &mut file).await;
        let closed = store.close().await;

        let written = match (written, closed) {
            (Ok(n), Ok(())) => n,
            (Ok(_), Err(close_err)) => return Err(close_err),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(close_err)) => {
                tracing::warn!("closing raw file store {} after failed upload: {}", id, close_err);
                return Err(e);
            }
        };

        if written != size {
            return Err(ClientError::SizeMismatch {
                expected: size,
                written,
            });
        }

        tracing::info!("uploaded {} as file {} ({} bytes)", path.display(), id, written);
        Ok(saved)
    }
}
