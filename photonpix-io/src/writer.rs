//! File writers for raw frames and clusters.

use crate::{Error, Result};
use ndarray::ArrayView2;
use photonpix_core::{ClusterBuffer, ClusterValue};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writer for headerless raw `u16` frame files.
///
/// The output can be read back with [`RawFrameReader`](crate::RawFrameReader).
pub struct RawFrameWriter {
    writer: BufWriter<File>,
    shape: (usize, usize),
    frames_written: usize,
}

impl RawFrameWriter {
    /// Creates a new file for frames of `shape = (rows, cols)`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, shape: (usize, usize)) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            shape,
            frames_written: 0,
        })
    }

    /// Appends one frame in row-major order.
    ///
    /// # Errors
    /// Returns `Error::InvalidFormat` for a frame of the wrong shape, or an
    /// I/O error.
    pub fn write_frame(&mut self, frame: ArrayView2<'_, u16>) -> Result<()> {
        if frame.dim() != self.shape {
            return Err(Error::InvalidFormat(format!(
                "frame shape {:?} does not match file shape {:?}",
                frame.dim(),
                self.shape
            )));
        }
        for &pixel in frame.iter() {
            self.writer.write_all(bytemuck::bytes_of(&pixel))?;
        }
        self.frames_written += 1;
        Ok(())
    }

    /// Number of frames written so far.
    #[must_use]
    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an I/O error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writer for cluster files.
///
/// Format: for each frame an `i32` frame number, a `u32` cluster count and the
/// raw records of the buffer, all in native byte order. Frame numbers are
/// truncated to 32 bits.
pub struct ClusterFileWriter {
    writer: BufWriter<File>,
    frames_written: u64,
    clusters_written: u64,
}

impl ClusterFileWriter {
    /// Creates a new cluster file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            frames_written: 0,
            clusters_written: 0,
        })
    }

    /// Appends the clusters of one frame.
    ///
    /// # Errors
    /// Returns `Error::InvalidFormat` if the buffer holds more than
    /// `u32::MAX` clusters, or an I/O error.
    pub fn write_frame<C: ClusterValue>(&mut self, clusters: &ClusterBuffer<C>) -> Result<()> {
        let n_clusters = u32::try_from(clusters.len()).map_err(|_| {
            Error::InvalidFormat(format!("{} clusters do not fit in a frame", clusters.len()))
        })?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let frame_number = clusters.frame_number() as i32;

        self.writer.write_all(bytemuck::bytes_of(&frame_number))?;
        self.writer.write_all(bytemuck::bytes_of(&n_clusters))?;
        self.writer.write_all(clusters.data())?;
        self.frames_written += 1;
        self.clusters_written += u64::from(n_clusters);
        Ok(())
    }

    /// Number of frames written so far.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Number of clusters written so far.
    #[must_use]
    pub fn clusters_written(&self) -> u64 {
        self.clusters_written
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an I/O error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ClusterFileReader, RawFrameReader, CLUSTER_FRAME_HEADER};
    use ndarray::Array2;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_raw_frames() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = RawFrameWriter::create(file.path(), (3, 4)).unwrap();
        let frame = Array2::from_shape_fn((3, 4), |(r, c)| (r * 10 + c) as u16);
        writer.write_frame(frame.view()).unwrap();
        writer.write_frame(frame.view()).unwrap();
        assert!(writer
            .write_frame(Array2::<u16>::zeros((4, 3)).view())
            .is_err());
        writer.flush().unwrap();
        assert_eq!(writer.frames_written(), 2);

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data.len(), 2 * 12 * 2);

        let reader = RawFrameReader::open(file.path(), (3, 4)).unwrap();
        assert_eq!(reader.frame(1).unwrap(), frame);
    }

    #[test]
    fn test_write_cluster_frames() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ClusterFileWriter::create(file.path()).unwrap();

        let mut first = ClusterBuffer::<i32>::with_capacity(3, 3, 4);
        first.set_frame_number(5);
        first.push_back(1, 2, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        first.push_back(3, 4, &[9; 9]).unwrap();
        let mut empty = ClusterBuffer::<i32>::new(3, 3);
        empty.set_frame_number(6);

        writer.write_frame(&first).unwrap();
        writer.write_frame(&empty).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.frames_written(), 2);
        assert_eq!(writer.clusters_written(), 2);

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data.len(), 2 * CLUSTER_FRAME_HEADER + 2 * first.item_size());

        let mut reader = ClusterFileReader::<i32>::open(file.path(), 3, 3).unwrap();
        let frames = reader.read_all().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_number(), 5);
        assert_eq!(frames[0].data(), first.data());
        assert_eq!(frames[1].frame_number(), 6);
        assert!(frames[1].is_empty());
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_read_clusters_across_frames() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ClusterFileWriter::create(file.path()).unwrap();
        for frame_number in 0..3 {
            let mut buffer = ClusterBuffer::<i16>::with_capacity(1, 1, 2);
            buffer.set_frame_number(frame_number);
            let value = i16::try_from(frame_number).unwrap();
            buffer.push_back(0, 0, &[value]).unwrap();
            buffer.push_back(1, 1, &[value]).unwrap();
            writer.write_frame(&buffer).unwrap();
        }
        writer.flush().unwrap();

        let mut reader = ClusterFileReader::<i16>::open(file.path(), 1, 1).unwrap();
        let chunk = reader.read_clusters(3).unwrap();
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.frame_number(), 0);
        assert_eq!(chunk.sum(), vec![0, 0, 1]);
        // one record of frame 1 is still pending
        assert!(reader.read_frame().is_err());

        let rest = reader.read_clusters(10).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.frame_number(), 1);
        assert!(reader.is_at_end());

        reader.rewind();
        assert_eq!(reader.by_ref().count(), 3);
    }
}
