//! Memory-mapped file readers.
//!

use crate::{Error, Result};
use memmap2::Mmap;
use ndarray::Array2;
use photonpix_core::{ClusterBuffer, ClusterValue};
use std::fs::File;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bytes of the per-frame header in a cluster file: `i32` frame number and
/// `u32` cluster count.
pub const CLUSTER_FRAME_HEADER: usize = size_of::<i32>() + size_of::<u32>();

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reader for headerless files of consecutive `u16` frames in native byte
/// order, row-major.
pub struct RawFrameReader {
    reader: MappedFileReader,
    shape: (usize, usize),
}

impl RawFrameReader {
    /// Opens a raw file holding frames of `shape = (rows, cols)`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or its size is not a
    /// whole number of frames.
    pub fn open<P: AsRef<Path>>(path: P, shape: (usize, usize)) -> Result<Self> {
        if shape.0 == 0 || shape.1 == 0 {
            return Err(Error::InvalidFormat(format!(
                "frame shape must be non-empty, got {shape:?}"
            )));
        }
        let reader = MappedFileReader::open(path)?;
        let frame_bytes = shape.0 * shape.1 * size_of::<u16>();
        if reader.len() % frame_bytes != 0 {
            return Err(Error::InvalidFormat(format!(
                "file size {} is not a multiple of the frame size {} (file: {})",
                reader.len(),
                frame_bytes,
                reader.path().display()
            )));
        }
        Ok(Self { reader, shape })
    }

    /// Frame shape `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Size of one frame in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.shape.0 * self.shape.1 * size_of::<u16>()
    }

    /// Number of frames in the file.
    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.reader.len() / self.frame_bytes()
    }

    /// Copies frame `index` out of the mapping.
    ///
    /// # Errors
    /// Returns `Error::InvalidFormat` if `index` is past the end.
    pub fn frame(&self, index: usize) -> Result<Array2<u16>> {
        if index >= self.n_frames() {
            return Err(Error::InvalidFormat(format!(
                "frame {index} out of range, file has {} frames",
                self.n_frames()
            )));
        }
        let start = index * self.frame_bytes();
        let bytes = &self.reader.as_bytes()[start..start + self.frame_bytes()];
        let pixels: Vec<u16> = bytes
            .chunks_exact(size_of::<u16>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        Array2::from_shape_vec(self.shape, pixels)
            .map_err(|err| Error::InvalidFormat(err.to_string()))
    }

    /// Iterates over all frames in file order.
    pub fn frames(&self) -> impl Iterator<Item = Result<Array2<u16>>> + '_ {
        (0..self.n_frames()).map(move |index| self.frame(index))
    }
}

/// Reader for cluster files as written by
/// [`ClusterFileWriter`](crate::ClusterFileWriter).
///
/// The file has no header, so the cluster geometry and value type must be
/// known. Every frame is stored as `frame_number: i32`, `n_clusters: u32`
/// followed by `n_clusters` packed records, in native byte order.
pub struct ClusterFileReader<C = i32> {
    reader: MappedFileReader,
    cluster_size_x: usize,
    cluster_size_y: usize,
    offset: usize,
    frame_number: u64,
    num_left: usize,
    _values: PhantomData<C>,
}

impl<C: ClusterValue> ClusterFileReader<C> {
    /// Opens a cluster file with `cluster_size_x x cluster_size_y` records.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(
        path: P,
        cluster_size_x: usize,
        cluster_size_y: usize,
    ) -> Result<Self> {
        if cluster_size_x == 0 || cluster_size_y == 0 {
            return Err(Error::InvalidFormat(format!(
                "cluster size must be non-empty, got {cluster_size_x}x{cluster_size_y}"
            )));
        }
        Ok(Self {
            reader: MappedFileReader::open(path)?,
            cluster_size_x,
            cluster_size_y,
            offset: 0,
            frame_number: 0,
            num_left: 0,
            _values: PhantomData,
        })
    }

    /// Size of one record in bytes.
    #[must_use]
    pub fn item_size(&self) -> usize {
        2 * size_of::<i16>() + self.cluster_size_x * self.cluster_size_y * size_of::<C>()
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    /// Returns true once every frame has been read.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.num_left == 0 && self.offset >= self.reader.len()
    }

    /// Starts reading from the beginning again.
    pub fn rewind(&mut self) {
        self.offset = 0;
        self.num_left = 0;
        self.frame_number = 0;
    }

    fn header(&self) -> Result<(u64, usize)> {
        let bytes = self.reader.as_bytes();
        if self.offset + CLUSTER_FRAME_HEADER > bytes.len() {
            return Err(Error::InvalidFormat(format!(
                "truncated frame header at byte {}",
                self.offset
            )));
        }
        let frame_number: i32 =
            bytemuck::pod_read_unaligned(&bytes[self.offset..self.offset + size_of::<i32>()]);
        let n_clusters: u32 = bytemuck::pod_read_unaligned(
            &bytes[self.offset + size_of::<i32>()..self.offset + CLUSTER_FRAME_HEADER],
        );
        // Frame numbers are stored in 32 bits; read them back unsigned.
        #[allow(clippy::cast_sign_loss)]
        let frame_number = u64::from(frame_number as u32);
        Ok((frame_number, n_clusters as usize))
    }

    fn take_records(&mut self, count: usize) -> Result<&[u8]> {
        let len = count * self.item_size();
        let bytes = self.reader.as_bytes();
        if self.offset + len > bytes.len() {
            return Err(Error::InvalidFormat(format!(
                "truncated cluster data at byte {}: need {} bytes, {} left",
                self.offset,
                len,
                bytes.len() - self.offset
            )));
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.reader.as_bytes()[start..start + len])
    }

    /// Reads the clusters of the next frame, or `None` at the end of the
    /// file.
    ///
    /// # Errors
    /// Returns `Error::InvalidFormat` for a truncated file or if a previous
    /// [`read_clusters`](Self::read_clusters) stopped inside a frame.
    pub fn read_frame(&mut self) -> Result<Option<ClusterBuffer<C>>> {
        if self.num_left != 0 {
            return Err(Error::InvalidFormat(format!(
                "{} clusters of frame {} left unread",
                self.num_left, self.frame_number
            )));
        }
        if self.offset >= self.reader.len() {
            return Ok(None);
        }
        let (frame_number, n_clusters) = self.header()?;
        self.offset += CLUSTER_FRAME_HEADER;
        let (sx, sy) = (self.cluster_size_x, self.cluster_size_y);
        let bytes = self.take_records(n_clusters)?.to_vec();
        self.frame_number = frame_number;
        Ok(Some(ClusterBuffer::from_bytes(sx, sy, frame_number, bytes)?))
    }

    /// Reads up to `n_clusters` records, crossing frame boundaries. The
    /// returned buffer carries the frame number of its first record.
    ///
    /// # Errors
    /// Returns `Error::InvalidFormat` for a truncated file.
    pub fn read_clusters(&mut self, n_clusters: usize) -> Result<ClusterBuffer<C>> {
        let mut out =
            ClusterBuffer::with_capacity(self.cluster_size_x, self.cluster_size_y, n_clusters);
        let mut first = true;
        while out.len() < n_clusters {
            if self.num_left == 0 {
                if self.offset >= self.reader.len() {
                    break;
                }
                let (frame_number, count) = self.header()?;
                self.offset += CLUSTER_FRAME_HEADER;
                self.frame_number = frame_number;
                self.num_left = count;
                continue;
            }
            if first {
                out.set_frame_number(self.frame_number);
                first = false;
            }
            let take = self.num_left.min(n_clusters - out.len());
            let item_size = self.item_size();
            let bytes = self.take_records(take)?;
            for record in bytes.chunks_exact(item_size) {
                out.push_record_bytes(record)?;
            }
            self.num_left -= take;
        }
        Ok(out)
    }

    /// Reads all remaining frames.
    ///
    /// # Errors
    /// See [`read_frame`](Self::read_frame).
    pub fn read_all(&mut self) -> Result<Vec<ClusterBuffer<C>>> {
        let mut frames = Vec::new();
        while let Some(buffer) = self.read_frame()? {
            frames.push(buffer);
        }
        Ok(frames)
    }
}

impl<C: ClusterValue> Iterator for ClusterFileReader<C> {
    type Item = Result<ClusterBuffer<C>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}
