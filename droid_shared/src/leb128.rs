//! LEB128 helpers used by the data section of the container.
use crate::ReadError;

pub fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_sleb128(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// `uleb128p1`: the value plus one, so that -1 (NO_INDEX) encodes as zero
pub fn write_uleb128p1(out: &mut Vec<u8>, value: Option<u32>) {
    match value {
        Some(value) => write_uleb128(out, value + 1),
        None => write_uleb128(out, 0),
    }
}

pub fn read_uleb128(data: &[u8], index: &mut usize) -> Result<u32, ReadError> {
    let mut result = 0u32;
    for shift in 0..5 {
        let byte = *data.get(*index).ok_or(ReadError::Truncated(*index))?;
        *index += 1;
        result |= ((byte & 0x7f) as u32) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ReadError::Malformed(format!("uleb128 at {:#x}", *index)))
}

pub fn read_sleb128(data: &[u8], index: &mut usize) -> Result<i32, ReadError> {
    let mut result = 0i32;
    let mut shift = 0;
    loop {
        let byte = *data.get(*index).ok_or(ReadError::Truncated(*index))?;
        *index += 1;
        result |= ((byte & 0x7f) as i32) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 && byte & 0x40 != 0 {
                result |= -1 << shift;
            }
            return Ok(result);
        }
        if shift >= 35 {
            return Err(ReadError::Malformed(format!("sleb128 at {:#x}", *index)));
        }
    }
}

pub fn read_uleb128p1(data: &[u8], index: &mut usize) -> Result<Option<u32>, ReadError> {
    let value = read_uleb128(data, index)?;
    Ok(value.checked_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        let mut out = Vec::new();
        write_uleb128(&mut out, 0x7f);
        write_uleb128(&mut out, 0x80);
        write_sleb128(&mut out, -1);
        write_sleb128(&mut out, -128);
        assert_eq!(out, vec![0x7f, 0x80, 0x01, 0x7f, 0x80, 0x7f]);

        let mut index = 0;
        assert_eq!(read_uleb128(&out, &mut index).unwrap(), 0x7f);
        assert_eq!(read_uleb128(&out, &mut index).unwrap(), 0x80);
        assert_eq!(read_sleb128(&out, &mut index).unwrap(), -1);
        assert_eq!(read_sleb128(&out, &mut index).unwrap(), -128);
        assert_eq!(index, out.len());
    }

    #[test]
    fn test_no_index() {
        let mut out = Vec::new();
        write_uleb128p1(&mut out, None);
        write_uleb128p1(&mut out, Some(4));
        let mut index = 0;
        assert_eq!(read_uleb128p1(&out, &mut index).unwrap(), None);
        assert_eq!(read_uleb128p1(&out, &mut index).unwrap(), Some(4));
    }
}
