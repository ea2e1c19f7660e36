//! Bluetooth extended-advertising container.
//!
//! The encrypted frame rides as the payload of a manufacturer-specific AD
//! element. Peer detection requires the advertisement to be extended and
//! the AD elements to match in type and order: Flags, 16-bit service
//! UUID, manufacturer data.

use bytes::{BufMut, BytesMut};

/// Bluetooth SIG company identifier carried at the start of the
/// manufacturer element.
pub const COMPANY_CODE: u16 = 0x0DE4;

/// 16-bit UUID of the Infuse service advertised alongside the frame.
pub const SERVICE_UUID: u16 = 0xFCD5;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_UUID16: u8 = 0x03;
const AD_TYPE_MANUFACTURER: u8 = 0xFF;

/// General discoverable, BR/EDR not supported.
const FLAGS_VALUE: u8 = 0x06;

/// Fixed AD bytes preceding the frame payload.
pub const CONTAINER_OVERHEAD: usize = 3 + 4 + 4;

/// Largest frame that fits the one-byte AD length field.
pub const MAX_FRAME: usize = 255 - 3;

/// Build the advertising data for one encrypted frame.
///
/// Returns `None` when the frame exceeds [`MAX_FRAME`].
pub fn build(frame: &[u8]) -> Option<BytesMut> {
    if frame.len() > MAX_FRAME {
        return None;
    }
    let mut out = BytesMut::with_capacity(CONTAINER_OVERHEAD + frame.len());
    // Flags element
    out.put_u8(2);
    out.put_u8(AD_TYPE_FLAGS);
    out.put_u8(FLAGS_VALUE);
    // Complete list of 16-bit service UUIDs
    out.put_u8(3);
    out.put_u8(AD_TYPE_UUID16);
    out.put_u16_le(SERVICE_UUID);
    // Manufacturer-specific data: company code then the frame
    out.put_u8((3 + frame.len()) as u8);
    out.put_u8(AD_TYPE_MANUFACTURER);
    out.put_u16_le(COMPANY_CODE);
    out.put_slice(frame);
    Some(out)
}

/// Extract the encrypted frame from peer advertising data.
///
/// `extended` is the advertiser's PDU kind; legacy advertisements are
/// never ours.
pub fn extract(extended: bool, data: &[u8]) -> Option<&[u8]> {
    if !extended {
        return None;
    }
    // Flags element, exactly as we emit it.
    let rest = expect_element(data, AD_TYPE_FLAGS, &[FLAGS_VALUE])?;
    // Service UUID element.
    let rest = expect_element(rest, AD_TYPE_UUID16, &SERVICE_UUID.to_le_bytes())?;
    // Manufacturer element: company code prefix, frame follows.
    let (ad_type, value, tail) = split_element(rest)?;
    if ad_type != AD_TYPE_MANUFACTURER || !tail.is_empty() {
        return None;
    }
    if value.len() < 2 {
        return None;
    }
    let (company, frame) = value.split_at(2);
    if company != COMPANY_CODE.to_le_bytes() {
        return None;
    }
    if frame.is_empty() {
        return None;
    }
    Some(frame)
}

/// Split the first AD element off `data`.
fn split_element(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&len, rest) = data.split_first()?;
    if len == 0 || rest.len() < len as usize {
        return None;
    }
    let (element, tail) = rest.split_at(len as usize);
    let (&ad_type, value) = element.split_first()?;
    Some((ad_type, value, tail))
}

/// Consume one element, requiring an exact type and value match.
fn expect_element<'a>(data: &'a [u8], ad_type: u8, value: &[u8]) -> Option<&'a [u8]> {
    let (found_type, found_value, tail) = split_element(data)?;
    if found_type != ad_type || found_value != value {
        return None;
    }
    Some(tail)
}
