//! Row-major index arithmetic shared by the transfer and layout kernels.

use std::ops::Range;

/// Row-major strides of `shape`.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Call `f(offset, len)` for every contiguous innermost run of the block
/// `ranges` inside a row-major tensor of `shape`, in row-major order.
fn for_each_run(shape: &[usize], ranges: &[Range<usize>], mut f: impl FnMut(usize, usize)) {
    let rank = shape.len();
    if rank == 0 {
        return;
    }
    let strides = strides(shape);
    let inner = ranges[rank - 1].len();
    let outer: Vec<usize> = ranges[..rank - 1].iter().map(ExactSizeIterator::len).collect();
    let count: usize = outer.iter().product();
    if inner == 0 || count == 0 {
        return;
    }
    let mut idx = vec![0; rank - 1];
    for _ in 0..count {
        let mut offset = ranges[rank - 1].start;
        for d in 0..rank - 1 {
            offset += (ranges[d].start + idx[d]) * strides[d];
        }
        f(offset, inner);
        for d in (0..rank - 1).rev() {
            idx[d] += 1;
            if idx[d] < outer[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

/// Copy the block `ranges` of `src` (shaped `shape`) into a dense vector.
pub(crate) fn gather_block<T: Copy>(src: &[T], shape: &[usize], ranges: &[Range<usize>]) -> Vec<T> {
    let mut out = Vec::with_capacity(ranges.iter().map(ExactSizeIterator::len).product());
    for_each_run(shape, ranges, |offset, len| {
        out.extend_from_slice(&src[offset..offset + len]);
    });
    out
}

/// Write a dense `block` into the region `ranges` of `dst` (shaped `shape`).
pub(crate) fn scatter_block<T: Copy>(
    dst: &mut [T],
    shape: &[usize],
    ranges: &[Range<usize>],
    block: &[T],
) {
    let mut cursor = 0;
    for_each_run(shape, ranges, |offset, len| {
        dst[offset..offset + len].copy_from_slice(&block[cursor..cursor + len]);
        cursor += len;
    });
}

/// Transpose a row-major tensor so that output dim `i` is input dim `dims[i]`.
pub(crate) fn permute<T: Copy>(src: &[T], shape: &[usize], dims: &[usize]) -> Vec<T> {
    let rank = shape.len();
    let in_strides = strides(shape);
    let out_shape: Vec<usize> = dims.iter().map(|&d| shape[d]).collect();
    let mut out = Vec::with_capacity(src.len());
    let mut idx = vec![0; rank];
    for _ in 0..src.len() {
        let offset: usize = (0..rank).map(|i| idx[i] * in_strides[dims[i]]).sum();
        out.push(src[offset]);
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < out_shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

/// Offset of each element of `shape` in a tensor broadcast from `from`.
///
/// `from` must have the same rank with every dim equal to `shape`'s or 1.
pub(crate) fn broadcast_offsets(shape: &[usize], from: &[usize]) -> Vec<usize> {
    let from_strides = strides(from);
    let numel: usize = shape.iter().product();
    let rank = shape.len();
    let mut out = Vec::with_capacity(numel);
    let mut idx = vec![0; rank];
    for _ in 0..numel {
        let offset: usize = (0..rank)
            .map(|d| if from[d] == 1 { 0 } else { idx[d] * from_strides[d] })
            .sum();
        out.push(offset);
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[5]), vec![1]);
    }

    #[test]
    fn test_gather_scatter_block() {
        let src: Vec<u32> = (0..24).collect();
        let shape = [2, 3, 4];
        let block = gather_block(&src, &shape, &[1..2, 0..3, 2..4]);
        assert_eq!(block, vec![14, 15, 18, 19, 22, 23]);

        let mut dst = vec![0u32; 24];
        scatter_block(&mut dst, &shape, &[1..2, 0..3, 2..4], &block);
        assert_eq!(dst[14], 14);
        assert_eq!(dst[23], 23);
        assert_eq!(dst[13], 0);
    }

    #[test]
    fn test_permute_swaps_axes() {
        let src: Vec<u32> = (0..6).collect();
        // [2, 3] -> [3, 2]
        assert_eq!(permute(&src, &[2, 3], &[1, 0]), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_broadcast_offsets() {
        assert_eq!(broadcast_offsets(&[2, 2], &[1, 2]), vec![0, 1, 0, 1]);
        assert_eq!(broadcast_offsets(&[2, 2], &[2, 1]), vec![0, 0, 1, 1]);
    }
}
