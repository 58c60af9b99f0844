//! Typed values in and out of the opaque payload blobs carried by value
//! messages. The runtime itself never looks inside a payload.

use rkyv::{
    bytecheck::CheckBytes, de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer, validation::validators::DefaultValidator, AlignedVec,
    Archive, Deserialize, Serialize,
};

use super::error::{Error, Result};

/// Archives `value` into a payload.
pub fn to_payload<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize<AllocSerializer<256>>,
{
    rkyv::to_bytes::<_, 256>(value)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| Error::Payload(e.to_string()))
}

/// Validates and deserializes a payload produced by [`to_payload`].
pub fn from_payload<T>(payload: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    // payloads arrive at arbitrary offsets inside a frame
    let mut aligned = AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<T>(&aligned).map_err(|_| {
        Error::Payload(format!(
            "{} byte payload is not a valid {}",
            payload.len(),
            std::any::type_name::<T>()
        ))
    })
}
