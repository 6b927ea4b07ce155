//! CameraSensor trait
//!
//! Hardware-agnostic interface for camera control in the style of pylablib
//! cameras. The generic 2D viewer only talks to this trait; vendor controllers
//! (the Basler one in this crate) implement it and add their own extras.

use arrow::array::{BinaryArray, StringArray, TimestampNanosecondArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};

/// Pixel format enumeration (extensible)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,   // 8-bit monochrome
    Mono12,  // 12-bit monochrome in a 16-bit container
    Mono12p, // 12-bit monochrome (packed on the wire, unpacked by the SDK)
    Mono16,  // 16-bit monochrome
}

impl PixelFormat {
    /// GenICam enumeration entry name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono12p => "Mono12p",
            PixelFormat::Mono16 => "Mono16",
        }
    }

    /// Parse a GenICam enumeration entry.
    pub fn parse(entry: &str) -> Option<Self> {
        match entry {
            "Mono8" => Some(PixelFormat::Mono8),
            "Mono12" => Some(PixelFormat::Mono12),
            "Mono12p" => Some(PixelFormat::Mono12p),
            "Mono16" => Some(PixelFormat::Mono16),
            _ => None,
        }
    }

    /// Significant bits per pixel.
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono12 | PixelFormat::Mono12p => 12,
            PixelFormat::Mono16 => 16,
        }
    }
}

/// Camera identification, as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transport-layer unique name, used to create the device.
    pub full_name: String,
    pub model_name: String,
    pub serial_number: String,
    pub device_class: String,
    pub device_version: String,
    pub vendor_name: String,
    /// Display name, e.g. `Basler daA1280-54um (40123456)`.
    pub friendly_name: String,
    pub user_defined_name: String,
}

/// Region of interest in unbinned sensor pixels.
///
/// Ends are exclusive. The image read out has
/// `(hend - hstart) / hbin` columns and `(vend - vstart) / vbin` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub hstart: u32,
    pub hend: u32,
    pub vstart: u32,
    pub vend: u32,
    pub hbin: u32,
    pub vbin: u32,
}

impl Roi {
    /// Whole sensor without binning.
    pub fn full_sensor(width: u32, height: u32) -> Self {
        Self {
            hstart: 0,
            hend: width,
            vstart: 0,
            vend: height,
            hbin: 1,
            vbin: 1,
        }
    }

    /// Columns of the read-out image.
    pub fn image_width(&self) -> u32 {
        self.hend.saturating_sub(self.hstart) / self.hbin.max(1)
    }

    /// Rows of the read-out image.
    pub fn image_height(&self) -> u32 {
        self.vend.saturating_sub(self.vstart) / self.vbin.max(1)
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {}, {})",
            self.hstart,
            self.hend - self.hstart,
            self.hbin,
            self.vstart,
            self.vend - self.vstart,
            self.vbin
        )
    }
}

/// Single frame with pixel data and metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame timestamp (nanoseconds since the Unix epoch)
    pub timestamp_ns: i64,
    /// Frame counter (for detecting dropped frames)
    pub frame_number: u64,
    /// Pixel format
    pub pixel_format: PixelFormat,
    /// Width in pixels (after binning)
    pub width: u32,
    /// Height in pixels (after binning)
    pub height: u32,
    /// ROI applied to this frame
    pub roi: Roi,
    /// Pixel data, row-major, each pixel a little-endian u16
    /// (length = width * height * 2)
    pub pixel_data: Vec<u8>,
}

impl Frame {
    /// Build a frame from 16-bit container pixels.
    pub fn from_pixels(
        pixels: &[u16],
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        roi: Roi,
        frame_number: u64,
        timestamp_ns: i64,
    ) -> Self {
        Self {
            timestamp_ns,
            frame_number,
            pixel_format,
            width,
            height,
            roi,
            pixel_data: pixels.iter().flat_map(|p| p.to_le_bytes()).collect(),
        }
    }

    /// Decode the pixel buffer.
    pub fn pixels(&self) -> Vec<u16> {
        self.pixel_data
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Per-pixel mean of `frames`, rounded to the nearest integer.
    ///
    /// Returns `None` for an empty slice or frames of differing geometry.
    /// Metadata is taken from the last frame.
    pub fn average(frames: &[Frame]) -> Option<Frame> {
        let mut acc = FrameAccumulator::default();
        for frame in frames {
            acc.add(frame.clone()).ok()?;
        }
        acc.finish()
    }
}

/// Running per-pixel sum of frames sharing one geometry.
///
/// Only the sum buffer and the most recent frame are held, so averaging
/// many frames does not grow with their number.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    sums: Vec<u64>,
    count: u64,
    last: Option<Frame>,
}

impl FrameAccumulator {
    /// Number of frames added so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fold `frame` into the sum.
    ///
    /// Fails when its size differs from the frames already added.
    pub fn add(&mut self, frame: Frame) -> AppResult<()> {
        match &self.last {
            Some(last) if last.width != frame.width || last.height != frame.height => {
                return Err(DaqError::Acquisition(format!(
                    "Frames to average differ in size: {}x{} and {}x{}",
                    last.width, last.height, frame.width, frame.height
                )));
            }
            Some(_) => {}
            None => self.sums = vec![0; frame.pixel_data.len() / 2],
        }
        for (sum, px) in self.sums.iter_mut().zip(frame.pixel_data.chunks_exact(2)) {
            *sum += u64::from(u16::from_le_bytes([px[0], px[1]]));
        }
        self.count += 1;
        self.last = Some(frame);
        Ok(())
    }

    /// The averaged frame, `None` when nothing was added.
    pub fn finish(self) -> Option<Frame> {
        let last = self.last?;
        let n = self.count;
        if n == 1 {
            return Some(last);
        }
        let mean: Vec<u16> = self.sums.iter().map(|s| ((s + n / 2) / n) as u16).collect();
        Some(Frame::from_pixels(
            &mean,
            last.width,
            last.height,
            last.pixel_format,
            last.roi,
            last.frame_number,
            last.timestamp_ns,
        ))
    }
}

/// Camera sensor trait
///
/// Mirrors the pylablib camera contract the generic viewer relies on.
/// Exposure is expressed in seconds, ROIs in unbinned sensor pixels.
pub trait CameraSensor: Send + 'static {
    /// Identification of the opened device.
    fn get_device_info(&self) -> AppResult<DeviceInfo>;

    /// Exposure time in seconds.
    fn get_exposure(&self) -> AppResult<f64>;

    /// Set the exposure time in seconds.
    fn set_exposure(&mut self, seconds: f64) -> AppResult<()>;

    /// Current region of interest and binning.
    fn get_roi(&self) -> AppResult<Roi>;

    /// Apply a region of interest and binning.
    ///
    /// Values are clamped to the detector and rounded to the hardware
    /// increments, so `get_roi()` afterwards may differ from `roi`.
    fn set_roi(&mut self, roi: Roi) -> AppResult<()>;

    /// Width and height of the detector in pixels.
    fn get_detector_size(&self) -> AppResult<(u32, u32)>;

    /// Latest available image, `None` when the camera has nothing to deliver.
    fn read_newest_image(&mut self) -> AppResult<Option<Frame>>;

    /// Whether a continuous acquisition is running.
    fn acquisition_in_progress(&self) -> bool;

    /// Stop and release a running acquisition.
    fn clear_acquisition(&mut self) -> AppResult<()>;

    /// Prepare the camera for a new acquisition.
    fn setup_acquisition(&mut self) -> AppResult<()>;

    /// Release the device.
    fn close(&mut self) -> AppResult<()>;

    /// Serialize frames to Arrow RecordBatch for storage/transfer
    ///
    /// # Output Schema
    /// ```text
    /// timestamp (i64 ns, Timestamp(Nanosecond))
    /// frame_number (u64)
    /// pixel_format (utf8)
    /// width (u32)
    /// height (u32)
    /// roi_hstart (u32)
    /// roi_vstart (u32)
    /// roi_hbin (u32)
    /// roi_vbin (u32)
    /// pixel_data (binary, little-endian u16 per pixel)
    /// ```
    fn to_arrow_frames(&self, frames: &[Frame]) -> AppResult<RecordBatch> {
        frames_to_record_batch(frames)
    }
}

/// Arrow schema shared by all frame exports.
pub static FRAME_SCHEMA: Lazy<Arc<Schema>> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(arrow::datatypes::TimeUnit::Nanosecond, None),
            false,
        ),
        Field::new("frame_number", DataType::UInt64, false),
        Field::new("pixel_format", DataType::Utf8, false),
        Field::new("width", DataType::UInt32, false),
        Field::new("height", DataType::UInt32, false),
        Field::new("roi_hstart", DataType::UInt32, false),
        Field::new("roi_vstart", DataType::UInt32, false),
        Field::new("roi_hbin", DataType::UInt32, false),
        Field::new("roi_vbin", DataType::UInt32, false),
        Field::new("pixel_data", DataType::Binary, false),
    ]))
});

/// Convert frames to an Arrow batch using [`FRAME_SCHEMA`].
pub fn frames_to_record_batch(frames: &[Frame]) -> AppResult<RecordBatch> {
    let timestamps: Vec<i64> = frames.iter().map(|f| f.timestamp_ns).collect();
    let frame_numbers: Vec<u64> = frames.iter().map(|f| f.frame_number).collect();
    let pixel_formats: StringArray = frames
        .iter()
        .map(|f| Some(f.pixel_format.as_str()))
        .collect();
    let widths: Vec<u32> = frames.iter().map(|f| f.width).collect();
    let heights: Vec<u32> = frames.iter().map(|f| f.height).collect();
    let hstarts: Vec<u32> = frames.iter().map(|f| f.roi.hstart).collect();
    let vstarts: Vec<u32> = frames.iter().map(|f| f.roi.vstart).collect();
    let hbins: Vec<u32> = frames.iter().map(|f| f.roi.hbin).collect();
    let vbins: Vec<u32> = frames.iter().map(|f| f.roi.vbin).collect();
    let pixel_data_array: BinaryArray = frames
        .iter()
        .map(|f| Some(f.pixel_data.as_slice()))
        .collect();

    RecordBatch::try_new(
        FRAME_SCHEMA.clone(),
        vec![
            Arc::new(TimestampNanosecondArray::from(timestamps)),
            Arc::new(UInt64Array::from(frame_numbers)),
            Arc::new(pixel_formats),
            Arc::new(UInt32Array::from(widths)),
            Arc::new(UInt32Array::from(heights)),
            Arc::new(UInt32Array::from(hstarts)),
            Arc::new(UInt32Array::from(vstarts)),
            Arc::new(UInt32Array::from(hbins)),
            Arc::new(UInt32Array::from(vbins)),
            Arc::new(pixel_data_array),
        ],
    )
    .map_err(DaqError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(values: &[u16], number: u64) -> Frame {
        Frame::from_pixels(
            values,
            2,
            2,
            PixelFormat::Mono12,
            Roi::full_sensor(2, 2),
            number,
            1_000 + number as i64,
        )
    }

    #[test]
    fn test_roi_image_size_accounts_for_binning() {
        let roi = Roi {
            hstart: 100,
            hend: 612,
            vstart: 20,
            vend: 276,
            hbin: 2,
            vbin: 2,
        };
        assert_eq!(roi.image_width(), 256);
        assert_eq!(roi.image_height(), 128);
        assert_eq!(roi.to_string(), "(100, 512, 2, 20, 256, 2)");
    }

    #[test]
    fn test_frame_pixels_roundtrip_little_endian() {
        let f = frame(&[0x0102, 4095, 0, 7], 0);
        assert_eq!(&f.pixel_data[..2], &[0x02, 0x01]);
        assert_eq!(f.pixels(), vec![0x0102, 4095, 0, 7]);
    }

    #[test]
    fn test_frame_average_rounds_to_nearest() {
        let frames = vec![frame(&[0, 10, 100, 4095], 1), frame(&[1, 11, 101, 4094], 2)];
        let avg = Frame::average(&frames).unwrap();
        assert_eq!(avg.pixels(), vec![1, 11, 101, 4095]);
        assert_eq!(avg.frame_number, 2);
    }

    #[test]
    fn test_frame_average_rejects_mismatched_geometry() {
        let mut other = frame(&[1, 2, 3, 4], 2);
        other.width = 4;
        other.height = 1;
        assert!(Frame::average(&[frame(&[1, 2, 3, 4], 1), other]).is_none());
        assert!(Frame::average(&[]).is_none());
    }

    #[test]
    fn test_accumulator_keeps_running_sum() {
        let mut acc = FrameAccumulator::default();
        for n in 0..1_000u64 {
            acc.add(frame(&[0, 1, 4095, (n % 2) as u16], n)).unwrap();
        }
        assert_eq!(acc.count(), 1_000);

        let mut other = frame(&[1, 2, 3, 4], 0);
        other.width = 4;
        other.height = 1;
        let err = acc.add(other).unwrap_err();
        assert!(err.to_string().contains("differ in size"));
        assert_eq!(acc.count(), 1_000);

        let avg = acc.finish().unwrap();
        assert_eq!(avg.pixels(), vec![0, 1, 4095, 1]);
        assert_eq!(avg.frame_number, 999);
        assert!(FrameAccumulator::default().finish().is_none());
    }

    #[test]
    fn test_frames_to_record_batch() {
        let batch = frames_to_record_batch(&[frame(&[1, 2, 3, 4], 0), frame(&[5, 6, 7, 8], 1)])
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 10);
        assert_eq!(batch.schema().field(2).name(), "pixel_format");
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!(PixelFormat::parse("Mono12"), Some(PixelFormat::Mono12));
        assert_eq!(PixelFormat::parse("RGB8"), None);
        assert_eq!(PixelFormat::Mono8.bit_depth(), 8);
    }
}
