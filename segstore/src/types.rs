use std::borrow::Cow;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{HashError, Result};

/// Trait for encoding keys and values into their stored byte form
pub trait BytesEncode<'a> {
    type EItem: 'a + ?Sized;

    /// Encode an item into bytes
    fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>>;

    /// Hash the encoded form. Routing always goes through the bytes so a key
    /// and its pre-encoded form land in the same segment.
    fn hash_alt<H: Hasher>(bytes: &[u8], state: &mut H) -> u64 {
        bytes.hash(state);
        state.finish()
    }
}

/// Trait for decoding stored bytes back into an item
pub trait BytesDecode<'a> {
    type DItem: 'a;

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem>;
}

/// Wrapper for plain-old-data types (numbers, fixed arrays)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Native<T>(PhantomData<T>);

impl<T> Default for Native<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// UTF-8 strings, decoded as borrowed `&str`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Str;

/// Raw byte slices, stored as is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Bytes;

/// Membership marker: entries of set-like containers carry no value bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NoValue;

impl<'a, T> BytesEncode<'a> for Native<T>
where
    T: bytemuck::Pod,
{
    type EItem = T;

    fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(bytemuck::bytes_of(item)))
    }
}

impl<'a, T> BytesDecode<'a> for Native<T>
where
    T: bytemuck::Pod,
{
    type DItem = T;

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem> {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(HashError::Decoding(format!(
                "Invalid byte length for {}: expected {}, got {}",
                std::any::type_name::<T>(),
                std::mem::size_of::<T>(),
                bytes.len()
            )));
        }
        // records sit at arbitrary heap offsets
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

impl<'a> BytesEncode<'a> for Str {
    type EItem = str;

    fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(item.as_bytes()))
    }
}

impl<'a> BytesDecode<'a> for Str {
    type DItem = &'a str;

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem> {
        std::str::from_utf8(bytes).map_err(|e| HashError::Decoding(e.to_string()))
    }
}

impl<'a> BytesEncode<'a> for Bytes {
    type EItem = [u8];

    fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(item))
    }
}

impl<'a> BytesDecode<'a> for Bytes {
    type DItem = &'a [u8];

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem> {
        Ok(bytes)
    }
}

impl<'a> BytesEncode<'a> for NoValue {
    type EItem = ();

    fn bytes_encode(_item: &'a Self::EItem) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(&[]))
    }
}

impl<'a> BytesDecode<'a> for NoValue {
    type DItem = ();

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem> {
        if !bytes.is_empty() {
            return Err(HashError::Decoding(format!(
                "membership entry carries {} value bytes",
                bytes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHasher;

    #[test]
    fn test_native_reads_unaligned_bytes() -> Result<()> {
        let mut buffer = vec![0u8; 9];
        buffer[1..].copy_from_slice(&0xdead_beef_u64.to_ne_bytes());

        let value = Native::<u64>::bytes_decode(&buffer[1..])?;
        assert_eq!(value, 0xdead_beef);
        Ok(())
    }

    #[test]
    fn test_native_rejects_wrong_length() {
        let err = Native::<u32>::bytes_decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, HashError::Decoding(_)));
    }

    #[test]
    fn test_str_rejects_invalid_utf8() {
        assert!(matches!(
            Str::bytes_decode(&[0xff, 0xfe]),
            Err(HashError::Decoding(_))
        ));
        assert_eq!(Str::bytes_decode(b"hello").unwrap(), "hello");
    }

    #[test]
    fn test_no_value_is_empty() -> Result<()> {
        assert!(NoValue::bytes_encode(&())?.is_empty());
        NoValue::bytes_decode(&[])?;
        assert!(NoValue::bytes_decode(&[1]).is_err());
        Ok(())
    }

    #[test]
    fn test_hash_alt_depends_only_on_bytes() -> Result<()> {
        let encoded = Str::bytes_encode("routing")?;
        let a = Str::hash_alt(&encoded, &mut FxHasher::default());
        let b = Bytes::hash_alt(b"routing", &mut FxHasher::default());
        assert_eq!(a, b);
        Ok(())
    }
}
