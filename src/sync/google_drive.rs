//! Google Drive client - `DriveApi` over the Drive v3 REST API.

use super::drive::{DriveApi, DriveFile, FileQuery, FOLDER_MIME_TYPE, ZIP_MIME_TYPE};
use super::oauth::SessionCredential;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Google Drive API endpoints
const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,size";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,modifiedTime,size)";

const MULTIPART_BOUNDARY: &str = "----McDriveSyncBoundary";

/// Response from files.list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// Authenticated Drive v3 client.
///
/// Every request asks the session for its access token, so an expired token
/// is refreshed before the request goes out.
pub struct GoogleDriveClient {
    client: reqwest::blocking::Client,
    session: Arc<SessionCredential>,
}

impl GoogleDriveClient {
    pub fn new(session: Arc<SessionCredential>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client, session })
    }

    fn bearer(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.session.access_token()?))
    }

    fn upload_multipart(&self, parent: &str, name: &str, content: Vec<u8>) -> Result<DriveFile> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct FileMetadata<'a> {
            name: &'a str,
            parents: Vec<&'a str>,
            mime_type: &'a str,
        }

        let metadata = serde_json::to_string(&FileMetadata {
            name,
            parents: vec![parent],
            mime_type: ZIP_MIME_TYPE,
        })?;

        let head = format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {mime}\r\n\r\n",
            boundary = MULTIPART_BOUNDARY,
            metadata = metadata,
            mime = ZIP_MIME_TYPE,
        );
        let mut body = head.into_bytes();
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{}--", MULTIPART_BOUNDARY).as_bytes());

        let response = self
            .client
            .post(DRIVE_UPLOAD_URL)
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header("Authorization", self.bearer()?)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()?;

        Ok(check(response)?.json()?)
    }
}

/// Turn a non-success response into `SyncError::Api`.
fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    Err(SyncError::Api { status, body })
}

fn read_content(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| SyncError::fs(path, e))
}

impl DriveApi for GoogleDriveClient {
    fn list(&self, query: &FileQuery) -> Result<Vec<DriveFile>> {
        let q = query.to_drive_query();
        debug!("Drive query: {}", q);

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", q.clone()),
                ("spaces", "drive".to_string()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", "1000".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(DRIVE_FILES_URL)
                .query(&params)
                .header("Authorization", self.bearer()?)
                .send()?;
            let page: DriveFileList = check(response)?.json()?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    fn create_folder(&self, name: &str) -> Result<DriveFile> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct CreateFolder<'a> {
            name: &'a str,
            mime_type: &'a str,
        }

        let response = self
            .client
            .post(DRIVE_FILES_URL)
            .query(&[("fields", FILE_FIELDS)])
            .header("Authorization", self.bearer()?)
            .json(&CreateFolder {
                name,
                mime_type: FOLDER_MIME_TYPE,
            })
            .send()?;

        let folder: DriveFile = check(response)?.json()?;
        info!("Created Drive folder '{}' ({})", folder.name, folder.id);
        Ok(folder)
    }

    fn create_file(&self, parent: &str, name: &str, content_path: &Path) -> Result<DriveFile> {
        let content = read_content(content_path)?;
        self.upload_multipart(parent, name, content)
    }

    fn update_file(&self, id: &str, content_path: &Path) -> Result<DriveFile> {
        let content = read_content(content_path)?;
        let url = format!("{}/{}", DRIVE_UPLOAD_URL, id);
        let response = self
            .client
            .patch(&url)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header("Authorization", self.bearer()?)
            .header("Content-Type", ZIP_MIME_TYPE)
            .body(content)
            .send()?;

        Ok(check(response)?.json()?)
    }

    fn download(&self, id: &str, dest: &mut dyn Write) -> Result<u64> {
        let url = format!("{}/{}", DRIVE_FILES_URL, id);
        let response = self
            .client
            .get(&url)
            .query(&[("alt", "media")])
            .header("Authorization", self.bearer()?)
            .send()?;

        let mut response = check(response)?;
        let total = response.content_length();
        let mut progress = DownloadProgress::new(total);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut written = 0u64;

        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| SyncError::Api {
                    status: 0,
                    body: format!("Download interrupted: {}", e),
                })?;
            if n == 0 {
                break;
            }
            dest.write_all(&buffer[..n])
                .map_err(|e| SyncError::fs("<download target>", e))?;
            written += n as u64;
            progress.advance(written);
        }

        Ok(written)
    }
}

/// Logs download progress in quarter steps.
struct DownloadProgress {
    total: Option<u64>,
    next_step: u64,
}

impl DownloadProgress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            next_step: 25,
        }
    }

    fn advance(&mut self, written: u64) {
        let Some(total) = self.total else { return };
        let percent = written.saturating_mul(100) / total;
        while self.next_step <= 100 && percent >= self.next_step {
            info!("Download progress: {}%", self.next_step);
            self.next_step += 25;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_steps_only_forward() {
        let mut progress = DownloadProgress::new(Some(400));
        progress.advance(50);
        assert_eq!(progress.next_step, 25);
        progress.advance(210);
        assert_eq!(progress.next_step, 75);
        progress.advance(400);
        assert_eq!(progress.next_step, 125);

        let mut unknown = DownloadProgress::new(None);
        unknown.advance(1_000);
        assert_eq!(unknown.next_step, 25);
    }

    #[test]
    fn test_list_response_parses() -> anyhow::Result<()> {
        let page: DriveFileList = serde_json::from_str(
            r#"{"nextPageToken":"p2","files":[{"id":"1","name":"mods.zip","mimeType":"application/zip","modifiedTime":"2024-01-01T00:00:00.000Z","size":"10"}]}"#,
        )?;
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(page.files[0].size, Some(10));
        Ok(())
    }
}
