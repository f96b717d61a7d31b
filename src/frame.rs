//! Video frame handed through the pipeline, plus region crop extraction.

use std::io::Cursor;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};
use tracing::debug;

use crate::detector::BBox;
use crate::error::ProviderError;

/// A captured frame. `jpeg` may be empty when pixels are not available
/// (e.g. detections replayed from a log).
#[derive(Debug, Clone)]
pub struct Frame {
    pub index:       u64,
    pub captured_at: DateTime<Utc>,
    pub width:       u32,
    pub height:      u32,
    pub jpeg:        Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, captured_at: DateTime<Utc>, width: u32, height: u32, jpeg: Vec<u8>) -> Self {
        Self { index, captured_at, width, height, jpeg }
    }

    /// Frame without pixel data.
    pub fn blank(index: u64, captured_at: DateTime<Utc>) -> Self {
        Self::new(index, captured_at, 0, 0, Vec::new())
    }

    pub fn has_pixels(&self) -> bool {
        !self.jpeg.is_empty()
    }

    /// Extract a JPEG-encoded crop of `bbox`, longest side capped at `max_px`.
    /// Returns `None` when the frame has no pixels or the box falls outside it.
    pub fn crop_jpeg(&self, bbox: &BBox, max_px: u32) -> Option<Vec<u8>> {
        if !self.has_pixels() {
            return None;
        }
        let img = image::load_from_memory(&self.jpeg)
            .map_err(|e| debug!("Frame {} decode failed: {}", self.index, e))
            .ok()?;

        let (fw, fh) = (img.width() as f32, img.height() as f32);
        let x1 = bbox.x.max(0.0).min(fw) as u32;
        let y1 = bbox.y.max(0.0).min(fh) as u32;
        let x2 = (bbox.x + bbox.width).max(0.0).min(fw) as u32;
        let y2 = (bbox.y + bbox.height).max(0.0).min(fh) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let crop = img.crop_imm(x1, y1, x2 - x1, y2 - y1);
        let longest = crop.width().max(crop.height());
        let crop = if longest > max_px {
            let scale = max_px as f32 / longest as f32;
            let w = ((crop.width() as f32 * scale) as u32).max(1);
            let h = ((crop.height() as f32 * scale) as u32).max(1);
            crop.resize_exact(w, h, FilterType::Triangle)
        } else {
            crop
        };

        encode_jpeg(&crop)
    }
}

// ─── Frame sources ───────────────────────────────────────────────────────────

#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Fixed-rate frames with a synthetic clock, optionally all carrying the same
/// still image. Pairs with `ReplayDetector` when no camera is attached.
pub struct PacedFrames {
    next_index: u64,
    total:      Option<u64>,
    start:      DateTime<Utc>,
    interval:   Duration,
    realtime:   bool,
    width:      u32,
    height:     u32,
    jpeg:       Vec<u8>,
}

impl PacedFrames {
    pub fn new(start: DateTime<Utc>, fps: f64, total: Option<u64>) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 1.0 };
        Self {
            next_index: 0,
            total,
            start,
            interval: Duration::microseconds((1_000_000.0 / fps) as i64),
            realtime: false,
            width: 0,
            height: 0,
            jpeg: Vec::new(),
        }
    }

    /// Sleep one interval between frames instead of emitting them back to back.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Attach a still JPEG to every frame.
    pub fn with_image(mut self, jpeg: Vec<u8>) -> Result<Self, ProviderError> {
        let img = image::load_from_memory(&jpeg).map_err(|e| ProviderError::Input {
            provider: "frames",
            detail: format!("still image: {}", e),
        })?;
        self.width = img.width();
        self.height = img.height();
        self.jpeg = jpeg;
        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl FrameSource for PacedFrames {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.total.is_some_and(|total| self.next_index >= total) {
            return None;
        }
        if self.realtime && self.next_index > 0 {
            if let Ok(pause) = self.interval.to_std() {
                tokio::time::sleep(pause).await;
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        let captured_at = self
            .start
            .checked_add_signed(frame_offset(self.interval, index))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(Frame::new(index, captured_at, self.width, self.height, self.jpeg.clone()))
    }
}

/// Time of frame `index` relative to the first one, saturating instead of
/// wrapping for very long runs.
fn frame_offset(interval: Duration, index: u64) -> Duration {
    let step = interval.num_microseconds().unwrap_or(0);
    let index = i64::try_from(index).unwrap_or(i64::MAX);
    Duration::microseconds(step.saturating_mul(index))
}

fn encode_jpeg(img: &DynamicImage) -> Option<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 75))
        .map_err(|e| debug!("JPEG encode failed: {}", e))
        .ok()?;
    Some(buf.into_inner())
}

#[cfg(test)]
pub(crate) fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    encode_jpeg(&DynamicImage::ImageRgb8(img)).expect("encode test jpeg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_is_resized_to_max_side() {
        let frame = Frame::new(1, Utc::now(), 200, 100, test_jpeg(200, 100));
        let bytes = frame
            .crop_jpeg(&BBox::new(10.0, 10.0, 160.0, 80.0), 40)
            .unwrap();
        let crop = image::load_from_memory(&bytes).unwrap();
        assert_eq!(crop.width(), 40);
        assert_eq!(crop.height(), 20);
    }

    #[test]
    fn crop_is_clamped_to_frame() {
        let frame = Frame::new(1, Utc::now(), 64, 64, test_jpeg(64, 64));
        let bytes = frame
            .crop_jpeg(&BBox::new(-20.0, 40.0, 50.0, 100.0), 500)
            .unwrap();
        let crop = image::load_from_memory(&bytes).unwrap();
        assert_eq!((crop.width(), crop.height()), (30, 24));
    }

    #[test]
    fn no_crop_outside_or_without_pixels() {
        let frame = Frame::new(1, Utc::now(), 64, 64, test_jpeg(64, 64));
        assert!(frame.crop_jpeg(&BBox::new(100.0, 100.0, 10.0, 10.0), 100).is_none());
        assert!(Frame::blank(2, Utc::now())
            .crop_jpeg(&BBox::new(0.0, 0.0, 10.0, 10.0), 100)
            .is_none());
    }

    #[tokio::test]
    async fn paced_frames_advance_synthetic_clock() {
        let start = Utc::now();
        let mut frames = PacedFrames::new(start, 4.0, Some(3))
            .with_image(test_jpeg(32, 16))
            .unwrap();
        assert_eq!(frames.interval(), Duration::milliseconds(250));

        let mut seen = Vec::new();
        while let Some(f) = frames.next_frame().await {
            assert_eq!((f.width, f.height), (32, 16));
            seen.push((f.index, f.captured_at - start));
        }
        assert_eq!(
            seen,
            vec![
                (0, Duration::zero()),
                (1, Duration::milliseconds(250)),
                (2, Duration::milliseconds(500)),
            ]
        );
    }

    #[test]
    fn frame_offset_keeps_growing_past_i32_indices() {
        let interval = Duration::milliseconds(250);
        let past = i32::MAX as u64 + 5;
        assert_eq!(frame_offset(interval, past), Duration::milliseconds(250 * past as i64));
        assert!(frame_offset(interval, past + 1) > frame_offset(interval, past));
        assert_eq!(frame_offset(interval, u64::MAX), Duration::microseconds(i64::MAX));
    }

    #[test]
    fn bad_still_image_is_rejected() {
        let err = PacedFrames::new(Utc::now(), 1.0, None).with_image(vec![1, 2, 3]);
        assert!(matches!(err, Err(ProviderError::Input { .. })));
    }
}
