use std::collections::{BTreeMap, HashSet};

use super::{PlistError, PlistValue};

const MAGIC: &[u8] = b"bplist00";
const TRAILER_LEN: usize = 32;

/// Decodes a binary plist (`bplist00`) into a [`PlistValue`] tree.
pub fn decode(data: &[u8]) -> Result<PlistValue, PlistError> {
    if data.len() < MAGIC.len() + TRAILER_LEN {
        return Err(PlistError::Truncated {
            needed: MAGIC.len() + TRAILER_LEN,
            have: data.len(),
        });
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(PlistError::BadMagic);
    }
    let trailer = Trailer::parse(data)?;
    let decoder = Decoder::new(data, &trailer)?;
    decoder.decode_object(trailer.root_object as usize, &mut HashSet::new())
}

// Last 32 bytes of the document: sizes, object count, root index and the
// position of the offset table.
struct Trailer {
    offset_size: usize,
    ref_size: usize,
    num_objects: u64,
    root_object: u64,
    table_offset: u64,
}

impl Trailer {
    fn parse(data: &[u8]) -> Result<Self, PlistError> {
        let t = &data[data.len() - TRAILER_LEN..];
        let trailer = Self {
            offset_size: t[6] as usize,
            ref_size: t[7] as usize,
            num_objects: u64::from_be_bytes(t[8..16].try_into().unwrap()),
            root_object: u64::from_be_bytes(t[16..24].try_into().unwrap()),
            table_offset: u64::from_be_bytes(t[24..32].try_into().unwrap()),
        };
        if !matches!(trailer.offset_size, 1 | 2 | 4 | 8)
            || !matches!(trailer.ref_size, 1 | 2 | 4 | 8)
        {
            return Err(PlistError::InvalidTrailer);
        }
        Ok(trailer)
    }
}

fn read_be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn read_be_int(bytes: &[u8]) -> i64 {
    // 1/2/4-byte integers are unsigned in the format; only 8-byte ones carry
    // a sign.
    match bytes.len() {
        8 => i64::from_be_bytes(bytes.try_into().unwrap()),
        _ => read_be_uint(bytes) as i64,
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    offsets: Vec<usize>,
    ref_size: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], trailer: &Trailer) -> Result<Self, PlistError> {
        let start = usize::try_from(trailer.table_offset).map_err(|_| PlistError::InvalidTrailer)?;
        let count = usize::try_from(trailer.num_objects).map_err(|_| PlistError::InvalidTrailer)?;
        let table_len = count
            .checked_mul(trailer.offset_size)
            .ok_or(PlistError::InvalidTrailer)?;
        let end = start.checked_add(table_len).ok_or(PlistError::InvalidTrailer)?;
        if end > data.len() {
            return Err(PlistError::Truncated {
                needed: end,
                have: data.len(),
            });
        }

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let entry = start + i * trailer.offset_size;
            offsets.push(read_be_uint(&data[entry..entry + trailer.offset_size]) as usize);
        }
        Ok(Self {
            data,
            offsets,
            ref_size: trailer.ref_size,
        })
    }

    fn slice(&self, pos: usize, len: usize) -> Result<&'a [u8], PlistError> {
        self.data
            .get(pos..)
            .and_then(|d| d.get(..len))
            .ok_or(PlistError::Truncated {
                needed: pos.saturating_add(len),
                have: self.data.len(),
            })
    }

    fn byte_at(&self, pos: usize) -> Result<u8, PlistError> {
        Ok(self.slice(pos, 1)?[0])
    }

    fn decode_object(
        &self,
        index: usize,
        seen: &mut HashSet<usize>,
    ) -> Result<PlistValue, PlistError> {
        if !seen.insert(index) {
            return Err(PlistError::CircularReference);
        }
        let pos = *self
            .offsets
            .get(index)
            .ok_or(PlistError::InvalidReference(index as u64))?;
        let marker = self.byte_at(pos)?;
        let value = self.decode_value(marker, pos + 1, seen)?;
        seen.remove(&index);
        Ok(value)
    }

    fn decode_value(
        &self,
        marker: u8,
        pos: usize,
        seen: &mut HashSet<usize>,
    ) -> Result<PlistValue, PlistError> {
        let low = marker & 0x0f;
        match marker >> 4 {
            0x0 => match low {
                0x8 => Ok(PlistValue::Boolean(false)),
                0x9 => Ok(PlistValue::Boolean(true)),
                _ => Err(PlistError::InvalidMarker(marker)),
            },
            0x1 => {
                let len = 1usize << low;
                if len > 8 {
                    return Err(PlistError::InvalidMarker(marker));
                }
                Ok(PlistValue::Integer(read_be_int(self.slice(pos, len)?)))
            }
            0x2 => match low {
                2 => {
                    let bytes: [u8; 4] = self.slice(pos, 4)?.try_into().unwrap();
                    Ok(PlistValue::Real(f64::from(f32::from_be_bytes(bytes))))
                }
                3 => {
                    let bytes: [u8; 8] = self.slice(pos, 8)?.try_into().unwrap();
                    Ok(PlistValue::Real(f64::from_be_bytes(bytes)))
                }
                _ => Err(PlistError::InvalidMarker(marker)),
            },
            // Dates are seconds relative to the Apple epoch; the bridge has
            // no use for them beyond carrying the number.
            0x3 => {
                let bytes: [u8; 8] = self.slice(pos, 8)?.try_into().unwrap();
                Ok(PlistValue::Real(f64::from_be_bytes(bytes)))
            }
            0x4 => {
                let (len, pos) = self.read_length(pos, low)?;
                Ok(PlistValue::Data(self.slice(pos, len)?.to_vec()))
            }
            0x5 => {
                let (len, pos) = self.read_length(pos, low)?;
                String::from_utf8(self.slice(pos, len)?.to_vec())
                    .map(PlistValue::String)
                    .map_err(|_| PlistError::InvalidString)
            }
            0x6 => {
                let (len, pos) = self.read_length(pos, low)?;
                let bytes = self.slice(pos, len.checked_mul(2).ok_or(PlistError::InvalidTrailer)?)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map(PlistValue::String)
                    .map_err(|_| PlistError::InvalidString)
            }
            0xA => {
                let (len, pos) = self.read_length(pos, low)?;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let object = self.read_ref(pos + i * self.ref_size)?;
                    items.push(self.decode_object(object, seen)?);
                }
                Ok(PlistValue::Array(items))
            }
            0xD => {
                let (len, pos) = self.read_length(pos, low)?;
                let values_pos = pos + len * self.ref_size;
                let mut dict = BTreeMap::new();
                for i in 0..len {
                    let key_ref = self.read_ref(pos + i * self.ref_size)?;
                    let value_ref = self.read_ref(values_pos + i * self.ref_size)?;
                    let key = match self.decode_object(key_ref, seen)? {
                        PlistValue::String(s) => s,
                        _ => return Err(PlistError::InvalidString),
                    };
                    dict.insert(key, self.decode_object(value_ref, seen)?);
                }
                Ok(PlistValue::Dictionary(dict))
            }
            _ => Err(PlistError::InvalidMarker(marker)),
        }
    }

    // Collections and byte/character runs keep their count in the marker's
    // low nibble, or in a following integer object when it doesn't fit.
    fn read_length(&self, pos: usize, low: u8) -> Result<(usize, usize), PlistError> {
        if low != 0x0f {
            return Ok((low as usize, pos));
        }
        let marker = self.byte_at(pos)?;
        if marker >> 4 != 0x1 {
            return Err(PlistError::InvalidMarker(marker));
        }
        let len_bytes = 1usize << (marker & 0x0f);
        if len_bytes > 8 {
            return Err(PlistError::InvalidMarker(marker));
        }
        let len = read_be_uint(self.slice(pos + 1, len_bytes)?) as usize;
        Ok((len, pos + 1 + len_bytes))
    }

    fn read_ref(&self, pos: usize) -> Result<usize, PlistError> {
        Ok(read_be_uint(self.slice(pos, self.ref_size)?) as usize)
    }
}
