use bytes::Bytes;

use crate::frame::Error;

/// Strip padding from a PADDED payload.
///
/// Returns the number of padding octets (the pad-length octet itself
/// included), leaving `payload` holding only the real data.
pub fn strip_padding(payload: &mut Bytes) -> Result<u8, Error> {
    if payload.is_empty() {
        return Err(Error::TooMuchPadding);
    }

    let pad_len = payload[0] as usize;

    if pad_len >= payload.len() {
        // The padding length must be strictly less than the remaining
        // payload, otherwise the frame carries no data at all.
        return Err(Error::TooMuchPadding);
    }

    let _ = payload.split_to(1);
    let data_len = payload.len() - pad_len;
    let _ = payload.split_off(data_len);

    Ok(pad_len as u8 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_padding_and_reports_consumed_octets() {
        let mut payload = Bytes::from_static(&[2, b'h', b'i', 0, 0]);
        let consumed = strip_padding(&mut payload).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(&payload[..], b"hi");
    }

    #[test]
    fn rejects_padding_covering_whole_payload() {
        let mut payload = Bytes::from_static(&[4, 0, 0, 0, 0]);
        assert_eq!(strip_padding(&mut payload), Err(Error::TooMuchPadding));
    }
}
