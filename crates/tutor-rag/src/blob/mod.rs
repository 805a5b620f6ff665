//! Image blob storage. Derived page pictures are downscaled, re-encoded
//! as JPEG and uploaded under an opaque key; chunks keep only the public
//! URL. Upload failures are non-fatal: the chunk simply proceeds without
//! that image reference.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::BlobConfig;
use crate::error::IngestError;

const MAX_EDGE: u32 = 1024;
const JPEG_QUALITY: u8 = 80;

pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    public_url: String,
}

impl BlobStore {
    /// Build the S3 client and verify the bucket is writable. The bucket's
    /// public-read policy is provisioned out-of-band; this only checks
    /// access.
    pub async fn connect(config: &BlobConfig) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(format!("http://{}", config.endpoint))
            .with_allow_http(true)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key)
            .with_region("us-east-1")
            .build()
            .context("Failed to build blob store client")?;

        let blob_store = Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        };
        blob_store.verify_access().await?;
        Ok(blob_store)
    }

    async fn verify_access(&self) -> Result<()> {
        let probe = ObjectPath::from(".probe");
        self.store
            .put(&probe, PutPayload::from(Vec::<u8>::new()))
            .await
            .context("Blob store bucket is not writable")?;
        self.store.delete(&probe).await.ok();
        tracing::info!(bucket = %self.bucket, "Blob store ready");
        Ok(())
    }

    /// Upload a raster image, returning its public URL, or `None` when
    /// anything fails along the way.
    pub async fn upload_image(&self, image_bytes: &[u8]) -> Option<String> {
        match self.try_upload(image_bytes).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, "Image upload failed, continuing without it");
                None
            }
        }
    }

    async fn try_upload(&self, image_bytes: &[u8]) -> Result<String, IngestError> {
        let jpeg =
            prepare_jpeg(image_bytes).map_err(|e| IngestError::Blob(format!("re-encode: {e}")))?;

        let key = format!("{}.jpg", Uuid::new_v4());
        let path = ObjectPath::from(key.as_str());

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "image/jpeg".into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&path, PutPayload::from(jpeg), options)
            .await
            .map_err(|e| IngestError::Blob(format!("upload: {e}")))?;

        Ok(format!("{}/{}/{}", self.public_url, self.bucket, key))
    }
}

/// Downscale to fit within 1024x1024 preserving aspect ratio, then
/// re-encode as JPEG.
pub fn prepare_jpeg(image_bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(image_bytes).context("Unreadable image")?;

    let img = if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img.resize(MAX_EDGE, MAX_EDGE, FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context("JPEG encoding failed")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn downscales_to_fit_preserving_aspect() {
        let jpeg = prepare_jpeg(&png_bytes(2048, 512)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 1024);
        assert_eq!(decoded.height(), 256);
    }

    #[test]
    fn small_images_keep_their_size() {
        let jpeg = prepare_jpeg(&png_bytes(300, 200)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (300, 200));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(prepare_jpeg(b"not an image").is_err());
    }
}
