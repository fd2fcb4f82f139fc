//! Pending attachments for the compose box.
//!
//! Staged attachments carry no server identity. Image files hold a preview
//! handle from a [`PreviewStore`]; the handle is released whenever the
//! attachment leaves the stager (removed, cleared, taken for sending, or the
//! stager dropped).

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{Context, Result};
use shared::protocol::AttachmentPayload;
use url::Url;
use uuid::Uuid;

use crate::error::StagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagedAttachmentId(pub Uuid);

impl fmt::Display for StagedAttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_guess::from_path(&file_name)
            .first()
            .map(|mime| mime.essence_str().to_string());
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read attachment '{}'", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("attachment path '{}' has no file name", path.display()))?;
        Ok(Self::new(file_name, bytes))
    }

    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|mime| mime.starts_with("image/"))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewHandle(pub u64);

/// Source of display previews for staged image files.
pub trait PreviewStore: Send + Sync {
    fn acquire(&self, file: &LocalFile) -> PreviewHandle;
    fn release(&self, handle: PreviewHandle);
}

/// Keeps preview bytes in memory until released.
#[derive(Default)]
pub struct InMemoryPreviewStore {
    next: AtomicU64,
    live: Mutex<HashMap<PreviewHandle, Arc<[u8]>>>,
}

impl InMemoryPreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or_default()
    }

    pub fn get(&self, handle: PreviewHandle) -> Option<Arc<[u8]>> {
        self.live
            .lock()
            .ok()
            .and_then(|live| live.get(&handle).cloned())
    }
}

impl PreviewStore for InMemoryPreviewStore {
    fn acquire(&self, file: &LocalFile) -> PreviewHandle {
        let handle = PreviewHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        if let Ok(mut live) = self.live.lock() {
            live.insert(handle, Arc::from(file.bytes.as_slice()));
        }
        handle
    }

    fn release(&self, handle: PreviewHandle) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&handle);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedSource {
    File {
        file: LocalFile,
        preview: Option<PreviewHandle>,
    },
    Url(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub id: StagedAttachmentId,
    pub source: StagedSource,
}

impl StagedAttachment {
    pub fn label(&self) -> &str {
        match &self.source {
            StagedSource::File { file, .. } => &file.file_name,
            StagedSource::Url(url) => url.as_str(),
        }
    }

    pub fn preview(&self) -> Option<PreviewHandle> {
        match &self.source {
            StagedSource::File { preview, .. } => *preview,
            StagedSource::Url(_) => None,
        }
    }
}

/// Staged attachments split for sending: files to upload and the slot each
/// upload result fills in the ordered record list.
#[derive(Debug, Default)]
pub struct OutgoingAttachments {
    files: Vec<LocalFile>,
    slots: Vec<OutgoingSlot>,
}

#[derive(Debug)]
enum OutgoingSlot {
    Upload,
    Link(AttachmentPayload),
}

impl OutgoingAttachments {
    pub fn from_staged(staged: Vec<StagedAttachment>) -> Self {
        let mut outgoing = Self::default();
        for attachment in staged {
            match attachment.source {
                StagedSource::File { file, .. } => {
                    outgoing.files.push(file);
                    outgoing.slots.push(OutgoingSlot::Upload);
                }
                StagedSource::Url(url) => outgoing
                    .slots
                    .push(OutgoingSlot::Link(AttachmentPayload::from_url(url.as_str()))),
            }
        }
        outgoing
    }

    /// Records shown on the optimistic user turn before uploads finish. Files
    /// carry their name, type and size but no URL yet.
    pub fn placeholders(&self) -> Vec<AttachmentPayload> {
        let mut files = self.files.iter();
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                OutgoingSlot::Link(record) => Some(record.clone()),
                OutgoingSlot::Upload => files.next().map(|file| AttachmentPayload {
                    id: None,
                    url: String::new(),
                    file_name: Some(file.file_name.clone()),
                    file_type: file.mime_type.clone(),
                    file_size: Some(file.size()),
                }),
            })
            .collect()
    }

    pub fn needs_upload(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, OutgoingSlot::Upload))
    }

    pub fn take_files(&mut self) -> Vec<LocalFile> {
        std::mem::take(&mut self.files)
    }

    fn upload_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, OutgoingSlot::Upload))
            .count()
    }

    /// Merges upload results back into staging order.
    pub fn commit(self, uploaded: Vec<AttachmentPayload>) -> Result<Vec<AttachmentPayload>> {
        let expected = self.upload_slots();
        anyhow::ensure!(
            uploaded.len() == expected,
            "upload returned {} records for {} files",
            uploaded.len(),
            expected
        );
        let mut uploaded = uploaded.into_iter();
        let mut records = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                OutgoingSlot::Link(record) => records.push(record),
                OutgoingSlot::Upload => {
                    if let Some(record) = uploaded.next() {
                        records.push(record);
                    }
                }
            }
        }
        Ok(records)
    }
}

pub struct AttachmentStager {
    previews: Arc<dyn PreviewStore>,
    attachments: Vec<StagedAttachment>,
}

impl AttachmentStager {
    pub fn new(previews: Arc<dyn PreviewStore>) -> Self {
        Self {
            previews,
            attachments: Vec::new(),
        }
    }

    pub fn add_files(&mut self, files: Vec<LocalFile>) -> Vec<StagedAttachmentId> {
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let preview = file.is_image().then(|| self.previews.acquire(&file));
            let id = StagedAttachmentId(Uuid::new_v4());
            self.attachments.push(StagedAttachment {
                id,
                source: StagedSource::File { file, preview },
            });
            ids.push(id);
        }
        ids
    }

    pub fn add_url(&mut self, raw: &str) -> Result<StagedAttachmentId, StagingError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StagingError::EmptyUrl);
        }
        let url = Url::parse(raw).map_err(|err| StagingError::InvalidUrl {
            raw: raw.to_string(),
            reason: err.to_string(),
        })?;
        let id = StagedAttachmentId(Uuid::new_v4());
        self.attachments.push(StagedAttachment {
            id,
            source: StagedSource::Url(url),
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: StagedAttachmentId) -> bool {
        let Some(index) = self.attachments.iter().position(|att| att.id == id) else {
            return false;
        };
        let removed = self.attachments.remove(index);
        self.release(&removed);
        true
    }

    pub fn clear(&mut self) {
        for attachment in std::mem::take(&mut self.attachments) {
            self.release(&attachment);
        }
    }

    /// Snapshots and clears the stager in one step.
    pub fn take(&mut self) -> Vec<StagedAttachment> {
        let taken = std::mem::take(&mut self.attachments);
        for attachment in &taken {
            self.release(attachment);
        }
        taken
    }

    pub fn attachments(&self) -> &[StagedAttachment] {
        &self.attachments
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    fn release(&self, attachment: &StagedAttachment) {
        if let Some(handle) = attachment.preview() {
            self.previews.release(handle);
        }
    }
}

impl Drop for AttachmentStager {
    fn drop(&mut self) {
        self.clear();
    }
}
