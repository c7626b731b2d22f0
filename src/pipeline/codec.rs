//! Page codec adapter: raw payload ⇄ pixel buffer.
//!
//! The adapter is a black box around the `image` crate's decoders and
//! encoders. It is stateless, so one instance is shared by every worker
//! behind an `Arc<dyn PageCodec>`; tests substitute an instrumented codec
//! through the same trait.
//!
//! ## Format checks
//!
//! The codec is picked from the payload's magic bytes. The entry's file
//! extension is only a cross-check: a `.jpg` entry holding PNG bytes is
//! reported as [`PageError::FormatMismatch`] instead of being decoded by
//! whatever decoder the name suggests.

use crate::config::OutputFormat;
use crate::error::PageError;
use crate::page::{PageKey, RawPage};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

/// Image codecs accepted as page payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl ImageKind {
    /// Identify the codec from the payload's leading bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        match image::guess_format(data).ok()? {
            ImageFormat::Png => Some(ImageKind::Png),
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Gif => Some(ImageKind::Gif),
            ImageFormat::WebP => Some(ImageKind::Webp),
            ImageFormat::Bmp => Some(ImageKind::Bmp),
            _ => None,
        }
    }

    /// Codec a file extension claims, if it names one we know.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageKind::Png),
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "gif" => Some(ImageKind::Gif),
            "webp" => Some(ImageKind::Webp),
            "bmp" => Some(ImageKind::Bmp),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Jpeg => ImageFormat::Jpeg,
            ImageKind::Gif => ImageFormat::Gif,
            ImageKind::Webp => ImageFormat::WebP,
            ImageKind::Bmp => ImageFormat::Bmp,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Png => "PNG",
            ImageKind::Jpeg => "JPEG",
            ImageKind::Gif => "GIF",
            ImageKind::Webp => "WebP",
            ImageKind::Bmp => "BMP",
        }
    }
}

/// Decoded size of a page, read from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u8,
}

impl PageGeometry {
    /// Bytes the decoded pixel buffer will occupy.
    pub fn decoded_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.bytes_per_pixel)
    }
}

/// Decode/encode primitives used by the workers.
///
/// Implementations must be safe to call concurrently on distinct pages.
pub trait PageCodec: Send + Sync {
    /// Read the page's dimensions without decoding pixel data.
    fn probe(&self, page: &RawPage) -> Result<PageGeometry, PageError>;

    /// Decode the payload into a pixel buffer.
    fn decode(&self, page: &RawPage) -> Result<DynamicImage, PageError>;

    /// Encode a transformed page into the output format.
    fn encode(
        &self,
        image: &DynamicImage,
        key: PageKey,
        format: OutputFormat,
    ) -> Result<Vec<u8>, PageError>;
}

/// The production codec, backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    /// Resolve the payload's codec and check it against the entry name.
    pub fn detect(&self, page: &RawPage) -> Result<ImageKind, PageError> {
        let actual = ImageKind::sniff(&page.data).ok_or_else(|| PageError::Decode {
            index: page.index,
            detail: "payload is not a recognised image format".into(),
        })?;

        if let Some(ext) = page.extension() {
            if let Some(declared) = ImageKind::from_extension(&ext) {
                if declared != actual {
                    return Err(PageError::FormatMismatch {
                        index: page.index,
                        declared: declared.name().into(),
                        actual: actual.name().into(),
                    });
                }
            }
        }
        Ok(actual)
    }
}

impl PageCodec for ImageCodec {
    fn probe(&self, page: &RawPage) -> Result<PageGeometry, PageError> {
        let kind = self.detect(page)?;
        let decode_error = |e: image::ImageError| PageError::Decode {
            index: page.index,
            detail: e.to_string(),
        };
        let decoder = ImageReader::with_format(Cursor::new(&page.data), kind.image_format())
            .into_decoder()
            .map_err(decode_error)?;
        let (width, height) = decoder.dimensions();
        Ok(PageGeometry {
            width,
            height,
            bytes_per_pixel: decoder.color_type().bytes_per_pixel(),
        })
    }

    fn decode(&self, page: &RawPage) -> Result<DynamicImage, PageError> {
        let kind = self.detect(page)?;
        let image = image::load_from_memory_with_format(&page.data, kind.image_format()).map_err(
            |e| PageError::Decode {
                index: page.index,
                detail: e.to_string(),
            },
        )?;
        debug!(
            page = page.index,
            "Decoded {} → {}x{} px",
            kind.name(),
            image.width(),
            image.height()
        );
        Ok(image)
    }

    fn encode(
        &self,
        image: &DynamicImage,
        key: PageKey,
        format: OutputFormat,
    ) -> Result<Vec<u8>, PageError> {
        let mut buf = Vec::new();
        let result = match format {
            OutputFormat::Png => image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png),
            OutputFormat::Jpeg { quality } => {
                image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
            }
        };
        result.map_err(|e| PageError::Encode {
            index: key.index,
            detail: e.to_string(),
        })?;
        debug!(page = %key, "Encoded page → {} bytes", buf.len());
        Ok(buf)
    }
}
