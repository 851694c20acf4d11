use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, Slice};

/// A box in N-dimensional index space: one half-open range per axis.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Bounds {
    ranges: Vec<Range<usize>>,
}

impl Bounds {
    pub(crate) fn new(ranges: Vec<Range<usize>>) -> Self {
        Self { ranges }
    }

    pub(crate) fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub(crate) fn shape(&self) -> Vec<usize> {
        self.ranges.iter().map(|range| range.len()).collect()
    }

    /// Number of cells
    pub(crate) fn cells(&self) -> usize {
        self.ranges.iter().map(|range| range.len()).product()
    }

    pub(crate) fn intersect(&self, other: &Bounds) -> Option<Bounds> {
        let mut ranges = vec![];
        for (a, b) in self.ranges.iter().zip(&other.ranges) {
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start >= end {
                return None;
            }
            ranges.push(start..end);
        }

        Some(Bounds::new(ranges))
    }

    /// These bounds expressed relative to the origin of `outer`
    pub(crate) fn relative_to(&self, outer: &Bounds) -> Bounds {
        Bounds::new(
            self.ranges
                .iter()
                .zip(&outer.ranges)
                .map(|(range, outer)| (range.start - outer.start)..(range.end - outer.start))
                .collect(),
        )
    }

    pub(crate) fn view<'a>(&self, mut array: ArrayViewD<'a, f64>) -> ArrayViewD<'a, f64> {
        array.slice_each_axis_inplace(|axis| Slice::from(self.ranges[axis.axis.index()].clone()));
        array
    }

    pub(crate) fn view_mut<'a>(&self, array: &'a mut ArrayD<f64>) -> ArrayViewMutD<'a, f64> {
        array.slice_each_axis_mut(|axis| Slice::from(self.ranges[axis.axis.index()].clone()))
    }
}

/// The regular grid of chunks laid over an array.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChunkGrid {
    shape: Vec<usize>,
    chunk_shape: Vec<usize>,
}

impl ChunkGrid {
    pub(crate) fn new(shape: Vec<usize>, chunk_shape: Vec<usize>) -> Self {
        Self { shape, chunk_shape }
    }

    pub(crate) fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    /// Cells of the chunk at grid position `index`, ignoring the edge of the array
    pub(crate) fn chunk_extent(&self, index: &[usize]) -> Bounds {
        Bounds::new(
            index
                .iter()
                .zip(&self.chunk_shape)
                .map(|(i, chunk)| i * chunk..(i + 1) * chunk)
                .collect(),
        )
    }

    /// Cells covered by the chunk at grid position `index`, clipped to the array
    pub(crate) fn chunk_bounds(&self, index: &[usize]) -> Bounds {
        Bounds::new(
            index
                .iter()
                .zip(&self.chunk_shape)
                .zip(&self.shape)
                .map(|((i, chunk), size)| {
                    let start = i * chunk;
                    start..(start + chunk).min(*size)
                })
                .collect(),
        )
    }

    /// Grid positions of all chunks that overlap `bounds`
    pub(crate) fn chunks_in(&self, bounds: &Bounds) -> GridIter {
        let start: Vec<usize> = bounds
            .ranges()
            .iter()
            .zip(&self.chunk_shape)
            .map(|(range, chunk)| range.start / chunk)
            .collect();
        let end: Vec<usize> = bounds
            .ranges()
            .iter()
            .zip(&self.chunk_shape)
            .map(|(range, chunk)| (range.end + chunk - 1) / chunk)
            .collect();
        let done = start.iter().zip(&end).any(|(start, end)| start >= end);

        GridIter {
            current: start.clone(),
            start,
            end,
            done,
        }
    }

    /// A full sized chunk filled with NaN.
    ///
    /// Chunks at the edge of the array keep the full shape, so they still fit once the array
    /// grows along its time axis.
    ///
    pub(crate) fn empty_chunk(&self) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(&self.chunk_shape), f64::NAN)
    }
}

/// Iterates over grid positions in row major order.
///
pub(crate) struct GridIter {
    current: Vec<usize>,
    start: Vec<usize>,
    end: Vec<usize>,
    done: bool,
}

impl Iterator for GridIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let index = self.current.clone();

        // Odometer increment, last axis fastest
        self.done = true;
        for axis in (0..self.current.len()).rev() {
            self.current[axis] += 1;
            if self.current[axis] < self.end[axis] {
                self.done = false;
                break;
            }
            self.current[axis] = self.start[axis];
        }

        Some(index)
    }
}
