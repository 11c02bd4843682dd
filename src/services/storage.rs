use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::core::config::Settings;

#[derive(Debug, Clone)]
pub(crate) struct StoredPage {
    pub(crate) bytes: Vec<u8>,
    pub(crate) media_type: String,
}

/// Object storage for scanned pages, keyed by `test_id/user_id/upload_id/page-N.<ext>`.
#[async_trait]
pub(crate) trait PageStore: Send + Sync {
    async fn put_page(&self, key: &str, media_type: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn get_page(&self, key: &str) -> anyhow::Result<StoredPage>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> anyhow::Result<String>;
}

pub(crate) fn page_key(
    test_id: &str,
    user_id: &str,
    upload_id: &str,
    page: usize,
    media_type: &str,
) -> String {
    format!("{test_id}/{user_id}/{upload_id}/page-{page}.{}", page_extension(media_type))
}

pub(crate) fn page_extension(media_type: &str) -> &'static str {
    match media_type {
        "application/pdf" => "pdf",
        "image/png" => "png",
        _ => "jpg",
    }
}

pub(crate) fn media_type_for_key(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
    download_timeout: Duration,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "print-omr-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let client = Client::new(&config);

        Ok(Some(Self {
            client,
            bucket: settings.s3().bucket.clone(),
            download_timeout: Duration::from_secs(settings.pipeline().download_timeout_seconds),
        }))
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<StoredPage> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {key}"))?;

        let media_type = object
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| media_type_for_key(key).to_string());
        let bytes = object
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of {key}"))?
            .into_bytes()
            .to_vec();

        Ok(StoredPage { bytes, media_type })
    }
}

#[async_trait]
impl PageStore for StorageService {
    async fn put_page(&self, key: &str, media_type: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(media_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("Failed to store {key}"))?;

        Ok(())
    }

    async fn get_page(&self, key: &str) -> anyhow::Result<StoredPage> {
        tokio::time::timeout(self.download_timeout, self.fetch(key))
            .await
            .map_err(|_| {
                anyhow::anyhow!("download of {key} timed out after {:?}", self.download_timeout)
            })?
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> anyhow::Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;

        Ok(presigned.uri().to_string())
    }
}
