//! Metric sinks for scalar series and label-map images
//!
//! Scalars are tagged (`train/source_main`, `val/MIoU`, ...) and indexed by
//! iteration. Label maps are colorized with the 19-class urban palette before
//! they are handed to a sink; the ignore label and any out-of-palette class
//! render black.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// 19-class palette, RGB per training id
pub const PALETTE: [[u8; 3]; 19] = [
    [128, 64, 128],
    [244, 35, 232],
    [70, 70, 70],
    [102, 102, 156],
    [190, 153, 153],
    [153, 153, 153],
    [250, 170, 30],
    [220, 220, 0],
    [107, 142, 35],
    [152, 251, 152],
    [70, 130, 180],
    [220, 20, 60],
    [255, 0, 0],
    [0, 0, 142],
    [0, 0, 70],
    [0, 60, 100],
    [0, 80, 100],
    [0, 0, 230],
    [119, 11, 32],
];

/// Interleaved RGB image, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl RgbImage {
    /// Write as binary PPM
    pub fn write_ppm<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        out.write_all(&self.data)?;
        out.flush()?;
        Ok(())
    }
}

/// Colorize a row-major label map
pub fn colorize(labels: &[i64], height: usize, width: usize) -> Result<RgbImage> {
    if labels.len() != height * width {
        return Err(Error::invalid_input(format!(
            "{} labels cannot fill a {}x{} image",
            labels.len(),
            height,
            width
        )));
    }
    let data = labels
        .iter()
        .flat_map(|&l| {
            usize::try_from(l)
                .ok()
                .and_then(|i| PALETTE.get(i))
                .copied()
                .unwrap_or([0, 0, 0])
        })
        .collect();
    Ok(RgbImage {
        width,
        height,
        data,
    })
}

/// Colorize the `index`-th map of an `[N, H, W]` label tensor
pub fn colorize_tensor(labels: &Tensor, index: usize) -> Result<RgbImage> {
    let (_, h, w) = labels.dims3()?;
    let values = labels
        .get(index)?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;
    colorize(&values, h, w)
}

/// Destination for training metrics
pub trait MetricsSink {
    /// Record one scalar
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    /// Record an image; sinks without image support ignore it
    fn add_image(&mut self, _tag: &str, _image: &RgbImage, _step: usize) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits every scalar as a `tracing` debug event
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        debug!(tag, value, step, "metric");
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
        debug!(tag, step, width = image.width, height = image.height, "image");
        Ok(())
    }
}

/// One scalar line of a JSONL metrics file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: usize,
    pub timestamp: DateTime<Utc>,
}

/// Appends scalars as JSON lines; images are written as PPM files beside it
pub struct JsonlSink {
    writer: BufWriter<File>,
    image_dir: PathBuf,
}

impl JsonlSink {
    /// Open (appending) `path`; images go to `<path stem>_images/`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("metrics");
        let image_dir = path.with_file_name(format!("{}_images", stem));

        info!("Writing metrics to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            image_dir,
        })
    }

    /// Read back every record of a metrics file
    pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<ScalarRecord>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            timestamp: Utc::now(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
        std::fs::create_dir_all(&self.image_dir)?;
        let file = format!("{}_{:08}.ppm", tag.replace('/', "_"), step);
        image.write_ppm(self.image_dir.join(file))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Shared in-process record of everything logged
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    scalars: Arc<Mutex<Vec<(String, f64, usize)>>>,
    images: Arc<Mutex<Vec<(String, usize)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(tag, value, step)` recorded so far
    pub fn scalars(&self) -> Vec<(String, f64, usize)> {
        self.scalars.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Values recorded under `tag`, in order
    pub fn series(&self, tag: &str) -> Vec<f64> {
        self.scalars()
            .into_iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, _)| v)
            .collect()
    }

    /// Image tags and steps recorded so far
    pub fn images(&self) -> Vec<(String, usize)> {
        self.images.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.scalars
            .lock()
            .map_err(|_| Error::invalid_state("metrics lock poisoned"))?
            .push((tag.to_string(), value, step));
        Ok(())
    }

    fn add_image(&mut self, tag: &str, _image: &RgbImage, step: usize) -> Result<()> {
        self.images
            .lock()
            .map_err(|_| Error::invalid_state("metrics lock poisoned"))?
            .push((tag.to_string(), step));
        Ok(())
    }
}

/// Forwards to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for FanoutSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        for sink in &mut self.sinks {
            sink.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
        for sink in &mut self.sinks {
            sink.add_image(tag, image, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_colorize_ignore_is_black() {
        let image = colorize(&[0, -1, 18, 42], 2, 2).unwrap();
        assert_eq!(&image.data[0..3], &[128, 64, 128]);
        assert_eq!(&image.data[3..6], &[0, 0, 0]);
        assert_eq!(&image.data[6..9], &[119, 11, 32]);
        assert_eq!(&image.data[9..12], &[0, 0, 0]);
        assert!(colorize(&[0, 1], 2, 2).is_err());
    }

    #[test]
    fn test_jsonl_sink_writes_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.add_scalar("train/source_main", 1.25, 3).unwrap();
            sink.add_scalar("val/MIoU", 0.4, 200).unwrap();
            let image = colorize(&[1, 2], 1, 2).unwrap();
            sink.add_image("val/pred", &image, 200).unwrap();
            sink.flush().unwrap();
        }

        let records = JsonlSink::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, "train/source_main");
        assert_eq!(records[1].step, 200);
        assert!(dir.path().join("run_images/val_pred_00000200.ppm").exists());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut fanout = FanoutSink::new().with(a.clone()).with(b.clone()).with(TracingSink);
        fanout.add_scalar("loss", 2.0, 1).unwrap();
        assert_eq!(a.series("loss"), vec![2.0]);
        assert_eq!(b.series("loss"), vec![2.0]);
    }
}
