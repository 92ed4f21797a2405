//! Mount-point reparse buffer codec.
//!
//! Byte layout (little endian):
//!
//! ```text
//! 0   u32  ReparseTag            IO_REPARSE_TAG_MOUNT_POINT
//! 4   u16  ReparseDataLength     bytes following this 8-byte header
//! 6   u16  Reserved
//! 8   u16  SubstituteNameOffset  relative to the path buffer
//! 10  u16  SubstituteNameLength  bytes, terminator excluded
//! 12  u16  PrintNameOffset
//! 14  u16  PrintNameLength
//! 16  ...  PathBuffer            substitute name, NUL, print name, NUL (UTF-16LE)
//! ```

use crate::error::{CacheError, Result};

/// Reparse tag of a directory junction.
pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;

/// Largest reparse buffer the filesystem accepts.
pub const MAXIMUM_REPARSE_DATA_BUFFER_SIZE: usize = 16 * 1024;

/// Size of tag + data length + reserved.
pub const REPARSE_HEADER_SIZE: usize = 8;

/// Header plus the four offset/length fields.
const MOUNT_POINT_HEADER_SIZE: usize = REPARSE_HEADER_SIZE + 8;

/// Device-path marker prefixed to the substitute name.
pub const NT_PATH_PREFIX: &str = r"\??\";

/// Decoded mount-point reparse data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointData {
    /// NT path, e.g. `\??\S:\Cache\C\Data`.
    pub substitute_name: String,
    /// Display path, e.g. `S:\Cache\C\Data`.
    pub print_name: String,
}

impl MountPointData {
    /// Build reparse data for a target directory path.
    pub fn for_target(target: &str) -> Self {
        let print_name = target
            .strip_prefix(NT_PATH_PREFIX)
            .unwrap_or(target)
            .to_string();
        Self {
            substitute_name: format!("{NT_PATH_PREFIX}{print_name}"),
            print_name,
        }
    }

    /// The target path with the device marker removed.
    pub fn target(&self) -> &str {
        self.substitute_name
            .strip_prefix(NT_PATH_PREFIX)
            .unwrap_or(&self.substitute_name)
    }

    /// Serialize into a buffer suitable for FSCTL_SET_REPARSE_POINT.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let substitute: Vec<u16> = self.substitute_name.encode_utf16().collect();
        let print: Vec<u16> = self.print_name.encode_utf16().collect();

        let substitute_len = substitute.len() * 2;
        let print_len = print.len() * 2;
        // both names are NUL terminated inside the path buffer
        let path_buffer_len = substitute_len + 2 + print_len + 2;
        let data_len = 8 + path_buffer_len;
        let total = REPARSE_HEADER_SIZE + data_len;

        if total > MAXIMUM_REPARSE_DATA_BUFFER_SIZE {
            return Err(CacheError::InvalidReparseData {
                reason: format!(
                    "target too long: buffer would be {total} bytes, limit is {MAXIMUM_REPARSE_DATA_BUFFER_SIZE}"
                ),
            });
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
        buf.extend_from_slice(&(data_len as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(substitute_len as u16).to_le_bytes());
        buf.extend_from_slice(&((substitute_len + 2) as u16).to_le_bytes());
        buf.extend_from_slice(&(print_len as u16).to_le_bytes());
        for unit in substitute.iter().chain(std::iter::once(&0)) {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        for unit in print.iter().chain(std::iter::once(&0)) {
            buf.extend_from_slice(&unit.to_le_bytes());
        }

        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Parse a buffer returned by FSCTL_GET_REPARSE_POINT.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MOUNT_POINT_HEADER_SIZE {
            return Err(invalid(format!("buffer too short: {} bytes", buf.len())));
        }
        if buf.len() > MAXIMUM_REPARSE_DATA_BUFFER_SIZE {
            return Err(invalid(format!("buffer too large: {} bytes", buf.len())));
        }

        let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if tag != IO_REPARSE_TAG_MOUNT_POINT {
            return Err(invalid(format!("unexpected reparse tag 0x{tag:08X}")));
        }

        let data_len = read_u16(buf, 4) as usize;
        if data_len < 8 || REPARSE_HEADER_SIZE + data_len > buf.len() {
            return Err(invalid(format!(
                "data length {data_len} exceeds buffer of {} bytes",
                buf.len()
            )));
        }

        let path_buffer = &buf[MOUNT_POINT_HEADER_SIZE..REPARSE_HEADER_SIZE + data_len];
        let substitute_name = read_name(path_buffer, read_u16(buf, 8), read_u16(buf, 10))?;
        let print_name = read_name(path_buffer, read_u16(buf, 12), read_u16(buf, 14))?;

        Ok(Self {
            substitute_name,
            print_name,
        })
    }
}

/// Header for FSCTL_DELETE_REPARSE_POINT: tag with zero data length.
pub fn delete_header() -> [u8; REPARSE_HEADER_SIZE] {
    let mut header = [0u8; REPARSE_HEADER_SIZE];
    header[..4].copy_from_slice(&IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
    header
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_name(path_buffer: &[u8], offset: u16, length: u16) -> Result<String> {
    let (offset, length) = (offset as usize, length as usize);
    if offset % 2 != 0 || length % 2 != 0 {
        return Err(invalid(format!(
            "misaligned name at offset {offset}, length {length}"
        )));
    }
    let bytes = path_buffer
        .get(offset..offset + length)
        .ok_or_else(|| invalid(format!("name at {offset}+{length} is out of bounds")))?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| invalid(format!("name is not valid UTF-16: {e}")))
}

fn invalid(reason: String) -> CacheError {
    CacheError::InvalidReparseData { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let data = MountPointData::for_target(r"S:\Cache\C\Data");
        let buf = data.encode().unwrap();

        // \??\S:\Cache\C\Data is 19 units, S:\Cache\C\Data is 15
        let sub_len = 19 * 2;
        let print_len = 15 * 2;
        assert_eq!(&buf[0..4], &[0x03, 0x00, 0x00, 0xA0]);
        assert_eq!(read_u16(&buf, 4) as usize, 8 + sub_len + 2 + print_len + 2);
        assert_eq!(read_u16(&buf, 6), 0);
        assert_eq!(read_u16(&buf, 8), 0);
        assert_eq!(read_u16(&buf, 10) as usize, sub_len);
        assert_eq!(read_u16(&buf, 12) as usize, sub_len + 2);
        assert_eq!(read_u16(&buf, 14) as usize, print_len);
        assert_eq!(buf.len(), 16 + sub_len + 2 + print_len + 2);

        // substitute name starts with '\' '?' '?' '\'
        assert_eq!(&buf[16..24], &[b'\\', 0, b'?', 0, b'?', 0, b'\\', 0]);
        // terminators
        assert_eq!(&buf[16 + sub_len..16 + sub_len + 2], &[0, 0]);
        assert_eq!(&buf[buf.len() - 2..], &[0, 0]);
    }

    #[test]
    fn test_round_trip() {
        let data = MountPointData::for_target(r"D:\Fast Cache\C\Projekt Ärger");
        let decoded = MountPointData::decode(&data.encode().unwrap()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.target(), r"D:\Fast Cache\C\Projekt Ärger");
    }

    #[test]
    fn test_prefixed_target_is_not_double_prefixed() {
        let data = MountPointData::for_target(r"\??\S:\Cache");
        assert_eq!(data.substitute_name, r"\??\S:\Cache");
        assert_eq!(data.print_name, r"S:\Cache");
    }

    #[test]
    fn test_rejects_wrong_tag() {
        let mut buf = MountPointData::for_target(r"C:\x").encode().unwrap();
        // IO_REPARSE_TAG_SYMLINK
        buf[..4].copy_from_slice(&0xA000_000Cu32.to_le_bytes());
        let err = MountPointData::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("unexpected reparse tag"));
    }

    #[test]
    fn test_rejects_truncated_buffer() {
        let buf = MountPointData::for_target(r"C:\somewhere").encode().unwrap();
        assert!(MountPointData::decode(&buf[..10]).is_err());
        assert!(MountPointData::decode(&buf[..buf.len() - 6]).is_err());
    }

    #[test]
    fn test_rejects_out_of_bounds_name() {
        let mut buf = MountPointData::for_target(r"C:\x").encode().unwrap();
        buf[14..16].copy_from_slice(&500u16.to_le_bytes());
        assert!(MountPointData::decode(&buf).is_err());
    }

    #[test]
    fn test_rejects_oversized_target() {
        let long = format!(r"C:\{}", "a".repeat(9000));
        assert!(MountPointData::for_target(&long).encode().is_err());
    }

    #[test]
    fn test_delete_header() {
        let header = delete_header();
        assert_eq!(&header[..4], &IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
        assert_eq!(&header[4..], &[0, 0, 0, 0]);
    }
}
