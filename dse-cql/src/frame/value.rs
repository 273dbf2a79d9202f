//! Bound values of a statement, serialized once into their wire form.

use std::net::IpAddr;

use bytes::{BufMut, Bytes};
use thiserror::Error;
use uuid::Uuid;

use super::frame_errors::CqlRequestSerializationError;
use super::types;

/// A single value could not be serialized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializeValuesError {
    /// Too many values were added.
    #[error("Too many values to add, max 65,535 values can be sent in a request")]
    TooManyValues,
    /// The value does not fit the `[bytes]` notation.
    #[error("Value too big to be sent in a request - max 2GiB allowed")]
    ValueTooBig,
}

/// A value as it appears on the wire: either bytes, `null` or `unset`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

/// Something that can be bound to a `?` marker.
///
/// Implementations append the value contents only; the length prefix is
/// written by [SerializedValues].
pub trait SerializeValue {
    fn serialize_contents(&self, buf: &mut Vec<u8>);

    /// `None` means `null`.
    fn is_null(&self) -> bool {
        false
    }
}

macro_rules! impl_serialize_value_for_num {
    ($($t:ty => $put:ident),* $(,)?) => {
        $(
            impl SerializeValue for $t {
                fn serialize_contents(&self, buf: &mut Vec<u8>) {
                    buf.$put(*self);
                }
            }
        )*
    };
}

impl_serialize_value_for_num!(
    i8 => put_i8,
    i16 => put_i16,
    i32 => put_i32,
    i64 => put_i64,
    f32 => put_f32,
    f64 => put_f64,
);

impl SerializeValue for bool {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        buf.put_u8(u8::from(*self));
    }
}

impl SerializeValue for str {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self.as_bytes());
    }
}

impl SerializeValue for String {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        self.as_str().serialize_contents(buf)
    }
}

impl SerializeValue for Bytes {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self);
    }
}

impl SerializeValue for Uuid {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self.as_bytes());
    }
}

impl SerializeValue for IpAddr {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        match self {
            IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
            IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
        }
    }
}

impl<T: SerializeValue> SerializeValue for Option<T> {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        if let Some(v) = self {
            v.serialize_contents(buf)
        }
    }

    fn is_null(&self) -> bool {
        self.as_ref().is_none_or(SerializeValue::is_null)
    }
}

impl<T: SerializeValue + ?Sized> SerializeValue for &T {
    fn serialize_contents(&self, buf: &mut Vec<u8>) {
        (**self).serialize_contents(buf)
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }
}

/// Values bound to a statement, kept in their serialized `[value]` form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
    has_unset: bool,
}

impl SerializedValues {
    /// A const empty instance, useful for taking references.
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized_values: Vec::new(),
        element_count: 0,
        has_unset: false,
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u16 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    /// Whether any value is `unset`, which only protocol v4 can carry.
    pub fn has_unset(&self) -> bool {
        self.has_unset
    }

    pub fn add_value<T: SerializeValue + ?Sized>(
        &mut self,
        val: &T,
    ) -> Result<(), SerializeValuesError> {
        self.check_capacity()?;
        if val.is_null() {
            types::write_int(-1, &mut self.serialized_values);
        } else {
            let len_pos = self.serialized_values.len();
            self.serialized_values.put_i32(0);
            val.serialize_contents(&mut self.serialized_values);
            let written = self.serialized_values.len() - len_pos - 4;
            let written = i32::try_from(written).map_err(|_| {
                self.serialized_values.truncate(len_pos);
                SerializeValuesError::ValueTooBig
            })?;
            self.serialized_values[len_pos..len_pos + 4].copy_from_slice(&written.to_be_bytes());
        }
        self.element_count += 1;
        Ok(())
    }

    pub fn add_null(&mut self) -> Result<(), SerializeValuesError> {
        self.check_capacity()?;
        types::write_int(-1, &mut self.serialized_values);
        self.element_count += 1;
        Ok(())
    }

    pub fn add_unset(&mut self) -> Result<(), SerializeValuesError> {
        self.check_capacity()?;
        types::write_int(-2, &mut self.serialized_values);
        self.element_count += 1;
        self.has_unset = true;
        Ok(())
    }

    fn check_capacity(&self) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        let mut buf = &self.serialized_values[..];
        (0..self.element_count).map(move |_| {
            // Contents were produced by `add_*`, so the layout is known to be valid.
            let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            buf = &buf[4..];
            match len {
                -2 => RawValue::Unset,
                l if l < 0 => RawValue::Null,
                l => {
                    let (v, rest) = buf.split_at(l as usize);
                    buf = rest;
                    RawValue::Value(v)
                }
            }
        })
    }

    /// Appends `<n><value_1>...<value_n>` to a request body.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }

    pub(crate) fn check_version(&self, version: u8) -> Result<(), CqlRequestSerializationError> {
        if self.has_unset && version < 4 {
            return Err(CqlRequestSerializationError::UnsupportedByVersion {
                what: "Unset value",
                version,
            });
        }
        Ok(())
    }
}
