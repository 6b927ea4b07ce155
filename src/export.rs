//! Arrow IPC export of grabbed frames.

use arrow::ipc::writer::FileWriter;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::AppResult;
use crate::traits::camera_sensor::{frames_to_record_batch, Frame};

/// File name for a snapshot taken at `time`, inside `dir`.
pub fn snapshot_path(dir: &Path, time: DateTime<Utc>) -> PathBuf {
    dir.join(format!("snap_{}.arrow", time.format("%Y%m%dT%H%M%S%.3f")))
}

/// Write `frames` as a single batch to an Arrow IPC file at `path`.
///
/// Parent directories are created as needed.
pub fn write_frames(path: &Path, frames: &[Frame]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let batch = frames_to_record_batch(frames)?;
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(file, &batch.schema())?;
    writer.write(&batch)?;
    writer.finish()?;
    info!(path = %path.display(), frames = frames.len(), "Frames exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::camera_sensor::{PixelFormat, Roi};
    use arrow::array::{Array, BinaryArray, UInt32Array};
    use arrow::ipc::reader::FileReader;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_path() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            snapshot_path(Path::new("data"), time),
            PathBuf::from("data/snap_20240301T123005.000.arrow")
        );
    }

    #[test]
    fn test_write_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frames.arrow");
        let roi = Roi::full_sensor(3, 2);
        let frame = Frame::from_pixels(&[1, 2, 3, 4, 5, 4095], 3, 2, PixelFormat::Mono12, roi, 7, 0);

        write_frames(&path, &[frame]).unwrap();

        let reader = FileReader::try_new(File::open(&path).unwrap(), None).unwrap();
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 1);

        let widths = batch
            .column_by_name("width")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        assert_eq!(widths.value(0), 3);
        let pixels = batch
            .column_by_name("pixel_data")
            .unwrap()
            .as_any()
            .downcast_ref::<BinaryArray>()
            .unwrap();
        assert_eq!(pixels.value(0).len(), 12);
        assert_eq!(&pixels.value(0)[10..], &4095u16.to_le_bytes());
    }
}
