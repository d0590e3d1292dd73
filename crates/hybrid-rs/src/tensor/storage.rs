//! Defines the scalar element trait used to move typed values in and out of host tensors.

use crate::backend::spec::DType;

/// Element type with a fixed little-endian encoding and a matching [`DType`].
pub trait Scalar: Copy + Default + Send + Sync + 'static {
    /// Dtype tag that tensors holding this element must carry.
    const DTYPE: DType;

    /// Decodes one element from exactly `DTYPE.size_in_bytes()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encodes one element into exactly `DTYPE.size_in_bytes()` bytes.
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($ty:ty, $dtype:expr) => {
        impl Scalar for $ty {
            const DTYPE: DType = $dtype;

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_scalar!(f32, DType::F32);
impl_scalar!(f64, DType::F64);
impl_scalar!(i32, DType::Si32);
impl_scalar!(i64, DType::Si64);

impl Scalar for bool {
    const DTYPE: DType = DType::I1;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }
}

/// Encodes `values` into a contiguous little-endian byte buffer.
pub fn encode<T: Scalar>(values: &[T]) -> Vec<u8> {
    let width = T::DTYPE.size_in_bytes();
    let mut bytes = vec![0u8; values.len() * width];
    for (chunk, value) in bytes.chunks_exact_mut(width).zip(values) {
        value.write_le(chunk);
    }
    bytes
}

/// Decodes a little-endian byte buffer into typed values.
pub fn decode<T: Scalar>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DTYPE.size_in_bytes())
        .map(T::read_le)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_encoding_uses_one_byte_per_element() {
        let bytes = encode(&[true, false, true]);
        assert_eq!(bytes, vec![1, 0, 1]);
        assert_eq!(decode::<bool>(&bytes), vec![true, false, true]);
    }

    #[test]
    fn integer_encoding_is_little_endian() {
        let bytes = encode(&[1i32, -2]);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(decode::<i32>(&bytes), vec![1, -2]);
    }
}
