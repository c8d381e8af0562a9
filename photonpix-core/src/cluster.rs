//! Fixed-geometry cluster records stored in one contiguous byte buffer.
//!
//! Every record is laid out as `x: i16, y: i16, values: [C; sx * sy]` in
//! native byte order, packed back to back. Sinks can dump [`ClusterBuffer::data`]
//! as is.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::error::{Error, Result};
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Add;

/// Coordinate type of a cluster center.
pub type Coord = i16;

const COORD_BYTES: usize = size_of::<Coord>();

/// Default number of records a new buffer has room for.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Numeric type stored in a cluster record.
pub trait ClusterValue:
    Pod + Default + fmt::Debug + PartialOrd + Add<Output = Self> + Send + Sync
{
    /// Converts a pedestal subtracted value. Integral types round to the
    /// nearest integer (saturating), floating types are cast.
    fn from_accumulated(value: f64) -> Self;
}

macro_rules! integral_cluster_value {
    ($($t:ty),*) => {
        $(
            impl ClusterValue for $t {
                #[inline]
                fn from_accumulated(value: f64) -> Self {
                    value.round() as $t
                }
            }
        )*
    };
}

macro_rules! floating_cluster_value {
    ($($t:ty),*) => {
        $(
            impl ClusterValue for $t {
                #[inline]
                fn from_accumulated(value: f64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

integral_cluster_value!(i16, i32, i64);
floating_cluster_value!(f32, f64);

/// Borrowed view of one record inside a [`ClusterBuffer`].
#[derive(Clone, Copy)]
pub struct ClusterRecord<'a, C> {
    bytes: &'a [u8],
    cluster_size_x: usize,
    cluster_size_y: usize,
    _values: PhantomData<C>,
}

impl<'a, C: ClusterValue> ClusterRecord<'a, C> {
    fn new(bytes: &'a [u8], cluster_size_x: usize, cluster_size_y: usize) -> Self {
        Self {
            bytes,
            cluster_size_x,
            cluster_size_y,
            _values: PhantomData,
        }
    }

    /// Column of the cluster center.
    #[must_use]
    pub fn x(&self) -> Coord {
        bytemuck::pod_read_unaligned(&self.bytes[..COORD_BYTES])
    }

    /// Row of the cluster center.
    #[must_use]
    pub fn y(&self) -> Coord {
        bytemuck::pod_read_unaligned(&self.bytes[COORD_BYTES..2 * COORD_BYTES])
    }

    /// Number of values in the record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cluster_size_x * self.cluster_size_y
    }

    /// Always false, records have at least one value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at flat index `i` (row-major inside the window).
    ///
    /// # Panics
    /// Panics if `i >= self.len()`.
    #[must_use]
    pub fn value(&self, i: usize) -> C {
        let start = 2 * COORD_BYTES + i * size_of::<C>();
        bytemuck::pod_read_unaligned(&self.bytes[start..start + size_of::<C>()])
    }

    /// Value at `(row, col)` inside the window.
    #[must_use]
    pub fn at(&self, row: usize, col: usize) -> C {
        self.value(row * self.cluster_size_x + col)
    }

    /// Iterates over the values.
    pub fn values(&self) -> impl Iterator<Item = C> + 'a {
        self.value_bytes()
            .chunks_exact(size_of::<C>())
            .map(bytemuck::pod_read_unaligned)
    }

    /// Raw bytes of the values, without the coordinates.
    #[must_use]
    pub fn value_bytes(&self) -> &'a [u8] {
        &self.bytes[2 * COORD_BYTES..]
    }

    /// Raw bytes of the whole record.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Sum of all values.
    #[must_use]
    pub fn sum(&self) -> C {
        self.values().fold(C::default(), |acc, v| acc + v)
    }

    /// Largest sum over any 2x2 sub-window (clipped to the window for
    /// records narrower than two pixels).
    #[must_use]
    pub fn max_sum_2x2(&self) -> C {
        let wx = self.cluster_size_x.min(2);
        let wy = self.cluster_size_y.min(2);
        let mut best: Option<C> = None;
        for row in 0..=self.cluster_size_y - wy {
            for col in 0..=self.cluster_size_x - wx {
                let mut total = C::default();
                for dr in 0..wy {
                    for dc in 0..wx {
                        total = total + self.at(row + dr, col + dc);
                    }
                }
                if best.map_or(true, |b| total > b) {
                    best = Some(total);
                }
            }
        }
        best.unwrap_or_default()
    }
}

impl<C: ClusterValue> fmt::Debug for ClusterRecord<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRecord")
            .field("x", &self.x())
            .field("y", &self.y())
            .field("values", &self.values().collect::<Vec<_>>())
            .finish()
    }
}

/// Growable container of cluster records sharing one geometry.
///
/// One buffer holds the clusters of one frame. Buffers are not `Clone`;
/// they move from stage to stage.
pub struct ClusterBuffer<C = i32> {
    cluster_size_x: usize,
    cluster_size_y: usize,
    data: Vec<u8>,
    size: usize,
    capacity: usize,
    frame_number: u64,
    _values: PhantomData<C>,
}

impl<C: ClusterValue> ClusterBuffer<C> {
    /// Creates an empty buffer with [`DEFAULT_CAPACITY`].
    ///
    /// # Panics
    /// Panics if either cluster dimension is zero.
    #[must_use]
    pub fn new(cluster_size_x: usize, cluster_size_y: usize) -> Self {
        Self::with_capacity(cluster_size_x, cluster_size_y, DEFAULT_CAPACITY)
    }

    /// Creates an empty buffer with room for `capacity` records.
    ///
    /// # Panics
    /// Panics if either cluster dimension is zero.
    #[must_use]
    pub fn with_capacity(cluster_size_x: usize, cluster_size_y: usize, capacity: usize) -> Self {
        assert!(
            cluster_size_x > 0 && cluster_size_y > 0,
            "cluster size must be non-zero, got {cluster_size_x}x{cluster_size_y}"
        );
        let stride = 2 * COORD_BYTES + cluster_size_x * cluster_size_y * size_of::<C>();
        Self {
            cluster_size_x,
            cluster_size_y,
            data: Vec::with_capacity(capacity * stride),
            size: 0,
            capacity,
            frame_number: 0,
            _values: PhantomData,
        }
    }

    /// Rebuilds a buffer from bytes written by a sink.
    ///
    /// # Errors
    /// Returns `Error::RecordSize` if `bytes` is not a whole number of records.
    pub fn from_bytes(
        cluster_size_x: usize,
        cluster_size_y: usize,
        frame_number: u64,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let mut buffer = Self::with_capacity(cluster_size_x, cluster_size_y, 0);
        let stride = buffer.item_size();
        if bytes.len() % stride != 0 {
            return Err(Error::RecordSize {
                expected: (bytes.len() / stride + 1) * stride,
                actual: bytes.len(),
            });
        }
        buffer.size = bytes.len() / stride;
        buffer.capacity = buffer.size;
        buffer.data = bytes;
        buffer.frame_number = frame_number;
        Ok(buffer)
    }

    /// Width of the cluster window.
    #[must_use]
    pub fn cluster_size_x(&self) -> usize {
        self.cluster_size_x
    }

    /// Height of the cluster window.
    #[must_use]
    pub fn cluster_size_y(&self) -> usize {
        self.cluster_size_y
    }

    /// Number of values per record.
    #[must_use]
    pub fn values_per_record(&self) -> usize {
        self.cluster_size_x * self.cluster_size_y
    }

    /// Size in bytes of one record (the element stride).
    #[must_use]
    pub fn item_size(&self) -> usize {
        2 * COORD_BYTES + self.values_per_record() * size_of::<C>()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of records that fit before the next reallocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frame the records were found in.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Tags the buffer with a frame number.
    pub fn set_frame_number(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
    }

    /// Raw bytes of all records.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Grows the capacity to at least `capacity` records. Never shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.data
                .reserve_exact((capacity - self.size) * self.item_size());
            self.capacity = capacity;
        }
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.size + additional;
        let mut capacity = self.capacity.max(1);
        while capacity < needed {
            capacity *= 2;
        }
        self.reserve(capacity);
    }

    /// Appends a record centered at `(x, y)`.
    ///
    /// # Errors
    /// Returns `Error::RecordSize` if `values` does not match the geometry.
    pub fn push_back(&mut self, x: Coord, y: Coord, values: &[C]) -> Result<()> {
        self.push_raw(x, y, bytemuck::cast_slice(values))
    }

    /// Appends a record from the raw bytes of its values.
    ///
    /// # Errors
    /// Returns `Error::RecordSize` if `value_bytes` does not match the
    /// geometry.
    pub fn push_raw(&mut self, x: Coord, y: Coord, value_bytes: &[u8]) -> Result<()> {
        let expected = self.item_size() - 2 * COORD_BYTES;
        if value_bytes.len() != expected {
            return Err(Error::RecordSize {
                expected,
                actual: value_bytes.len(),
            });
        }
        if self.size == self.capacity {
            self.grow_for(1);
        }
        self.data.extend_from_slice(bytemuck::bytes_of(&x));
        self.data.extend_from_slice(bytemuck::bytes_of(&y));
        self.data.extend_from_slice(value_bytes);
        self.size += 1;
        Ok(())
    }

    /// Appends a complete record (coordinates followed by values) as
    /// produced by [`ClusterRecord::as_bytes`].
    ///
    /// # Errors
    /// Returns `Error::RecordSize` if `bytes` is not exactly one record.
    pub fn push_record_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.item_size() {
            return Err(Error::RecordSize {
                expected: self.item_size(),
                actual: bytes.len(),
            });
        }
        let x: Coord = bytemuck::pod_read_unaligned(&bytes[..COORD_BYTES]);
        let y: Coord = bytemuck::pod_read_unaligned(&bytes[COORD_BYTES..2 * COORD_BYTES]);
        self.push_raw(x, y, &bytes[2 * COORD_BYTES..])
    }

    /// Returns the record at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ClusterRecord<'_, C>> {
        if index >= self.size {
            return None;
        }
        let stride = self.item_size();
        let start = index * stride;
        Some(ClusterRecord::new(
            &self.data[start..start + stride],
            self.cluster_size_x,
            self.cluster_size_y,
        ))
    }

    /// Iterates over the records.
    pub fn iter(&self) -> impl Iterator<Item = ClusterRecord<'_, C>> + '_ {
        let (sx, sy) = (self.cluster_size_x, self.cluster_size_y);
        self.data
            .chunks_exact(self.item_size())
            .map(move |bytes| ClusterRecord::new(bytes, sx, sy))
    }

    /// Sum of the values of each record.
    #[must_use]
    pub fn sum(&self) -> Vec<C> {
        self.iter().map(|record| record.sum()).collect()
    }

    /// Largest 2x2 sub-window sum of each record.
    #[must_use]
    pub fn sum_2x2(&self) -> Vec<C> {
        self.iter().map(|record| record.max_sum_2x2()).collect()
    }

    /// Removes all records, keeping the capacity.
    pub fn clear(&mut self) {
        self.data.clear();
        self.size = 0;
    }

    /// Moves all records of `other` to the end of this buffer.
    ///
    /// # Errors
    /// Returns `Error::GeometryMismatch` if the cluster sizes differ.
    pub fn append(&mut self, other: &mut Self) -> Result<()> {
        let left = (self.cluster_size_x, self.cluster_size_y);
        let right = (other.cluster_size_x, other.cluster_size_y);
        if left != right {
            return Err(Error::GeometryMismatch { left, right });
        }
        if self.size + other.size > self.capacity {
            self.grow_for(other.size);
        }
        self.data.extend_from_slice(&other.data);
        self.size += other.size;
        other.clear();
        Ok(())
    }

    /// Takes the records out, leaving an empty buffer behind.
    ///
    /// With `realloc_same_capacity` the replacement gets the same capacity,
    /// otherwise [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn steal(&mut self, realloc_same_capacity: bool) -> Self {
        let capacity = if realloc_same_capacity {
            self.capacity
        } else {
            DEFAULT_CAPACITY
        };
        let replacement = Self::with_capacity(self.cluster_size_x, self.cluster_size_y, capacity);
        std::mem::replace(self, replacement)
    }
}

impl<C> fmt::Debug for ClusterBuffer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBuffer")
            .field("cluster_size", &(self.cluster_size_x, self.cluster_size_y))
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("frame_number", &self.frame_number)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;

    #[test]
    fn test_push_back_then_read() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(2, 2, 4);
        assert_eq!(buffer.capacity(), 4);
        assert!(buffer.is_empty());
        // i16, i16, 2x2 i32
        assert_eq!(buffer.item_size(), 20);

        buffer.push_back(1, 2, &[3, 4, 5, 6]).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.capacity(), 4);

        let record = buffer.get(0).unwrap();
        assert_eq!(record.x(), 1);
        assert_eq!(record.y(), 2);
        assert_eq!(record.values().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(record.at(1, 0), 5);
        assert!(buffer.get(1).is_none());
    }

    #[test]
    fn test_raw_round_trip() {
        let mut buffer = ClusterBuffer::<i16>::with_capacity(3, 1, 2);
        let values: [i16; 3] = [-7, 300, 12];
        let bytes = bytemuck::cast_slice::<i16, u8>(&values).to_vec();
        buffer.push_raw(-4, 9, &bytes).unwrap();

        let record = buffer.get(0).unwrap();
        assert_eq!((record.x(), record.y()), (-4, 9));
        assert_eq!(record.value_bytes(), bytes.as_slice());

        let mut copy = ClusterBuffer::<i16>::with_capacity(3, 1, 1);
        copy.push_record_bytes(record.as_bytes()).unwrap();
        assert_eq!(copy.data(), buffer.data());
        assert!(copy.push_record_bytes(&bytes).is_err());
    }

    #[test]
    fn test_wrong_record_size() {
        let mut buffer = ClusterBuffer::<i32>::new(3, 3);
        let err = buffer.push_back(0, 0, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            Error::RecordSize {
                expected: 36,
                actual: 12
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_sum_and_growth() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(3, 1, 2);
        buffer.push_back(1, 2, &[3, 4, 5]).unwrap();
        buffer.push_back(6, 7, &[8, 9, 10]).unwrap();
        assert_eq!(buffer.capacity(), 2);

        buffer.push_back(11, 12, &[13, 14, 15]).unwrap();
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.sum(), vec![12, 27, 42]);
    }

    #[test]
    fn test_growth_keeps_records() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(3, 3, 0);
        let mut snapshots: Vec<Vec<u8>> = Vec::new();
        for i in 0..100i16 {
            let values: Vec<i32> = (0..9).map(|v| i32::from(i) * 10 + v).collect();
            buffer.push_back(i, -i, &values).unwrap();
            assert!(buffer.len() <= buffer.capacity());
            snapshots.push(buffer.get(snapshots.len()).unwrap().as_bytes().to_vec());
            for (j, snapshot) in snapshots.iter().enumerate() {
                assert_eq!(buffer.get(j).unwrap().as_bytes(), snapshot.as_slice());
            }
        }
        assert_eq!(buffer.capacity(), 128);
    }

    #[test]
    fn test_storing_floats() {
        let mut buffer = ClusterBuffer::<f32>::with_capacity(2, 4, 10);
        buffer
            .push_back(1, 2, &[3.0, 4.0, 5.0, 6.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        buffer
            .push_back(4, 5, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0])
            .unwrap();
        assert_eq!(buffer.sum(), vec![36.0, 8.0]);
        assert_eq!(buffer.get(1).unwrap().x(), 4);
    }

    #[test]
    fn test_sum_2x2() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(3, 3, 2);
        buffer
            .push_back(0, 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9])
            .unwrap();
        buffer.push_back(0, 0, &[9, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        // 5 + 6 + 8 + 9, then the upper left corner
        assert_eq!(buffer.sum_2x2(), vec![28, 9]);
    }

    #[test]
    fn test_reserve_does_not_touch_size() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(1, 1, 1);
        buffer.push_back(0, 0, &[1]).unwrap();
        buffer.reserve(50);
        assert_eq!(buffer.capacity(), 50);
        assert_eq!(buffer.len(), 1);
        buffer.reserve(10);
        assert_eq!(buffer.capacity(), 50);
    }

    #[test]
    fn test_steal() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(1, 1, 8);
        buffer.set_frame_number(42);
        buffer.push_back(3, 4, &[5]).unwrap();

        let stolen = buffer.steal(true);
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen.frame_number(), 42);
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.frame_number(), 0);

        let _ = buffer.steal(false);
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_from_bytes() {
        let mut buffer = ClusterBuffer::<i32>::with_capacity(2, 1, 2);
        buffer.push_back(1, 1, &[10, 20]).unwrap();
        buffer.push_back(2, 2, &[30, 40]).unwrap();

        let copy = ClusterBuffer::<i32>::from_bytes(2, 1, 5, buffer.data().to_vec()).unwrap();
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.frame_number(), 5);
        assert_eq!(copy.sum(), vec![30, 70]);

        let truncated = buffer.data()[..7].to_vec();
        assert!(ClusterBuffer::<i32>::from_bytes(2, 1, 0, truncated).is_err());
    }

    #[test]
    fn test_append() {
        let mut a = ClusterBuffer::<i32>::with_capacity(1, 2, 1);
        let mut b = ClusterBuffer::<i32>::with_capacity(1, 2, 4);
        a.push_back(0, 0, &[1, 1]).unwrap();
        for i in 0..3 {
            b.push_back(i, i, &[2, 2]).unwrap();
        }
        a.append(&mut b).unwrap();
        assert_eq!(a.len(), 4);
        assert!(a.capacity() >= 4);
        assert!(b.is_empty());

        let mut c = ClusterBuffer::<i32>::new(2, 1);
        assert!(a.append(&mut c).is_err());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(i32::from_accumulated(2.5), 3);
        assert_eq!(i32::from_accumulated(-2.4), -2);
        assert_eq!(i16::from_accumulated(1e9), i16::MAX);
        assert_eq!(f32::from_accumulated(2.25), 2.25);
    }
}
