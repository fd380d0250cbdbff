// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem command and directory entry layouts inside the shared arena
//!
//! All integers are native endian: the arena is shared between the normal
//! world and the secure OS running on the same CPU.

use std::mem::size_of;

use crate::validation::ValidationError;

/// Longest path (excluding the terminator) accepted from the secure side
pub const REEFS_PATH_MAX: usize = 1024;

/// `readdir` result when the stream has no further entries
pub const REEFS_DIR_END: i64 = -1;

/// Operation codes of the REEFS filesystem service
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReefsOp {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Truncate = 5,
    Unlink = 6,
    Rename = 7,
    Mkdir = 8,
    Rmdir = 9,
    Seek = 10,
    Opendir = 11,
    Closedir = 12,
    Readdir = 13,
    Seekdir = 14,
}

impl ReefsOp {
    pub const ALL: [ReefsOp; 14] = [
        ReefsOp::Open,
        ReefsOp::Close,
        ReefsOp::Read,
        ReefsOp::Write,
        ReefsOp::Truncate,
        ReefsOp::Unlink,
        ReefsOp::Rename,
        ReefsOp::Mkdir,
        ReefsOp::Rmdir,
        ReefsOp::Seek,
        ReefsOp::Opendir,
        ReefsOp::Closedir,
        ReefsOp::Readdir,
        ReefsOp::Seekdir,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            ReefsOp::Open => "open",
            ReefsOp::Close => "close",
            ReefsOp::Read => "read",
            ReefsOp::Write => "write",
            ReefsOp::Truncate => "truncate",
            ReefsOp::Unlink => "unlink",
            ReefsOp::Rename => "rename",
            ReefsOp::Mkdir => "mkdir",
            ReefsOp::Rmdir => "rmdir",
            ReefsOp::Seek => "seek",
            ReefsOp::Opendir => "opendir",
            ReefsOp::Closedir => "closedir",
            ReefsOp::Readdir => "readdir",
            ReefsOp::Seekdir => "seekdir",
        }
    }
}

impl TryFrom<i32> for ReefsOp {
    type Error = ValidationError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        ReefsOp::ALL
            .iter()
            .copied()
            .find(|op| op.code() == code)
            .ok_or(ValidationError::UnknownOp(code))
    }
}

const OP_OFFSET: usize = 0;
const FD_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 8;
// 4 bytes of padding keep `len` naturally aligned
const LEN_OFFSET: usize = 16;
const RET_OFFSET: usize = 24;

/// Fixed part of a filesystem command; `data` follows immediately
pub const FS_COMMAND_HEADER_LEN: usize = 32;

/// Decoded fixed fields of a filesystem command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsCommandHeader {
    pub op: i32,
    pub fd: i32,
    pub flags: i32,
    pub len: i64,
    pub ret: i64,
}

impl FsCommandHeader {
    pub fn new(op: i32) -> Self {
        Self {
            op,
            ..Default::default()
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ValidationError> {
        if buf.len() < FS_COMMAND_HEADER_LEN {
            return Err(ValidationError::Truncated(buf.len()));
        }
        Ok(Self {
            op: read_i32(buf, OP_OFFSET),
            fd: read_i32(buf, FD_OFFSET),
            flags: read_i32(buf, FLAGS_OFFSET),
            len: read_i64(buf, LEN_OFFSET),
            ret: read_i64(buf, RET_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), ValidationError> {
        if buf.len() < FS_COMMAND_HEADER_LEN {
            return Err(ValidationError::Truncated(buf.len()));
        }
        buf[OP_OFFSET..OP_OFFSET + 4].copy_from_slice(&self.op.to_ne_bytes());
        buf[FD_OFFSET..FD_OFFSET + 4].copy_from_slice(&self.fd.to_ne_bytes());
        buf[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&self.flags.to_ne_bytes());
        buf[FLAGS_OFFSET + 4..LEN_OFFSET].fill(0);
        buf[LEN_OFFSET..LEN_OFFSET + 8].copy_from_slice(&self.len.to_ne_bytes());
        buf[RET_OFFSET..RET_OFFSET + 8].copy_from_slice(&self.ret.to_ne_bytes());
        Ok(())
    }

    /// Write back only the result field
    pub fn store_ret(buf: &mut [u8], ret: i64) -> Result<(), ValidationError> {
        if buf.len() < FS_COMMAND_HEADER_LEN {
            return Err(ValidationError::Truncated(buf.len()));
        }
        buf[RET_OFFSET..RET_OFFSET + 8].copy_from_slice(&ret.to_ne_bytes());
        Ok(())
    }
}

/// Trailing data region of a command
pub fn command_data(buf: &[u8]) -> &[u8] {
    buf.get(FS_COMMAND_HEADER_LEN..).unwrap_or(&[])
}

pub fn command_data_mut(buf: &mut [u8]) -> &mut [u8] {
    match buf.get_mut(FS_COMMAND_HEADER_LEN..) {
        Some(data) => data,
        None => &mut [],
    }
}

/// First NUL-terminated string of a data region (terminator excluded)
pub fn parse_path(data: &[u8]) -> Result<&[u8], ValidationError> {
    let window = &data[..data.len().min(REEFS_PATH_MAX + 1)];
    match window.iter().position(|&b| b == 0) {
        Some(end) => Ok(&data[..end]),
        None if data.len() > REEFS_PATH_MAX => Err(ValidationError::PathTooLong),
        None => Err(ValidationError::UnterminatedPath),
    }
}

/// Two consecutive NUL-terminated strings (source, destination)
pub fn parse_path_pair(data: &[u8]) -> Result<(&[u8], &[u8]), ValidationError> {
    let first = parse_path(data)?;
    let second = parse_path(&data[first.len() + 1..])?;
    Ok((first, second))
}

/// Write `path` plus terminator at the start of `data`; returns bytes used
pub fn put_path(data: &mut [u8], path: &[u8]) -> Result<usize, ValidationError> {
    let needed = path.len() + 1;
    if needed > data.len() {
        return Err(ValidationError::LengthOutOfBounds {
            len: needed as i64,
            capacity: data.len(),
        });
    }
    data[..path.len()].copy_from_slice(path);
    data[path.len()] = 0;
    Ok(needed)
}

const DIRENT_RECLEN_OFFSET: usize = 0;
const DIRENT_COOKIE_OFFSET: usize = 8;
const DIRENT_TYPE_OFFSET: usize = 16;

/// `reclen` + `cookie` + `type`; the name starts right after
pub const DIRENT_HEADER_LEN: usize = 17;

/// Directory entry records are padded to the native word size
pub const DIRENT_ALIGN: usize = size_of::<usize>();

/// Packed length of a record carrying `name_len` name bytes
pub fn dirent_record_len(name_len: usize) -> usize {
    let raw = DIRENT_HEADER_LEN + name_len + 1;
    raw.div_ceil(DIRENT_ALIGN) * DIRENT_ALIGN
}

/// Pack one entry at the start of `out`. Returns the record length, or
/// `None` (leaving `out` untouched) when it does not fit.
pub fn write_dirent(out: &mut [u8], cookie: i64, d_type: u8, name: &[u8]) -> Option<usize> {
    let reclen = dirent_record_len(name.len());
    if reclen > out.len() {
        return None;
    }
    let record = &mut out[..reclen];
    record[DIRENT_RECLEN_OFFSET..DIRENT_RECLEN_OFFSET + 8]
        .copy_from_slice(&(reclen as u64).to_ne_bytes());
    record[DIRENT_COOKIE_OFFSET..DIRENT_COOKIE_OFFSET + 8].copy_from_slice(&cookie.to_ne_bytes());
    record[DIRENT_TYPE_OFFSET] = d_type;
    let name_start = DIRENT_HEADER_LEN;
    record[name_start..name_start + name.len()].copy_from_slice(name);
    record[name_start + name.len()..].fill(0);
    Some(reclen)
}

/// Borrowed view of one packed directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirentRef<'a> {
    pub reclen: usize,
    pub cookie: i64,
    pub d_type: u8,
    pub name: &'a [u8],
}

/// Walks a packed buffer by record length, the way the secure side does
pub struct DirentIter<'a> {
    buf: &'a [u8],
}

impl<'a> DirentIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for DirentIter<'a> {
    type Item = Result<DirentRef<'a>, ValidationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < DIRENT_HEADER_LEN {
            let len = self.buf.len();
            self.buf = &[];
            return Some(Err(ValidationError::Truncated(len)));
        }
        let reclen = read_u64(self.buf, DIRENT_RECLEN_OFFSET) as usize;
        if reclen <= DIRENT_HEADER_LEN || reclen > self.buf.len() || reclen % DIRENT_ALIGN != 0 {
            let len = self.buf.len();
            self.buf = &[];
            return Some(Err(ValidationError::Truncated(len)));
        }
        let record = &self.buf[..reclen];
        let name_area = &record[DIRENT_HEADER_LEN..];
        let name_len = name_area.iter().position(|&b| b == 0).unwrap_or(name_area.len());
        let entry = DirentRef {
            reclen,
            cookie: read_i64(record, DIRENT_COOKIE_OFFSET),
            d_type: record[DIRENT_TYPE_OFFSET],
            name: &name_area[..name_len],
        };
        self.buf = &self.buf[reclen..];
        Some(Ok(entry))
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_ne_bytes(bytes)
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_ne_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_fixed() {
        let mut buf = [0xffu8; FS_COMMAND_HEADER_LEN];
        let header = FsCommandHeader {
            op: ReefsOp::Write.code(),
            fd: 7,
            flags: 0o100,
            len: 2,
            ret: 0,
        };
        header.encode(&mut buf).unwrap();

        assert_eq!(&buf[0..4], &ReefsOp::Write.code().to_ne_bytes());
        assert_eq!(&buf[4..8], &7i32.to_ne_bytes());
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        assert_eq!(&buf[16..24], &2i64.to_ne_bytes());
        assert_eq!(FsCommandHeader::decode(&buf).unwrap(), header);

        FsCommandHeader::store_ret(&mut buf, -5).unwrap();
        assert_eq!(FsCommandHeader::decode(&buf).unwrap().ret, -5);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(
            FsCommandHeader::decode(&[0u8; 8]),
            Err(ValidationError::Truncated(8))
        );
    }

    #[test]
    fn op_codes_round_trip_and_unknown_codes_fail() {
        for op in ReefsOp::ALL {
            assert_eq!(ReefsOp::try_from(op.code()), Ok(op));
        }
        assert_eq!(ReefsOp::try_from(0), Err(ValidationError::UnknownOp(0)));
        assert_eq!(ReefsOp::try_from(99), Err(ValidationError::UnknownOp(99)));
    }

    #[test]
    fn paths_require_terminator() {
        assert_eq!(parse_path(b"/a/b\0junk").unwrap(), b"/a/b");
        assert_eq!(parse_path(b"\0").unwrap(), b"");
        assert_eq!(parse_path(b"/a/b"), Err(ValidationError::UnterminatedPath));

        let long = vec![b'a'; REEFS_PATH_MAX + 10];
        assert_eq!(parse_path(&long), Err(ValidationError::PathTooLong));
    }

    #[test]
    fn path_pair_reads_consecutive_strings() {
        let (from, to) = parse_path_pair(b"/a\0/b/c\0").unwrap();
        assert_eq!((from, to), (&b"/a"[..], &b"/b/c"[..]));
        assert_eq!(parse_path_pair(b"/a\0/b"), Err(ValidationError::UnterminatedPath));
    }

    #[test]
    fn record_length_is_word_aligned() {
        for name_len in 0..64 {
            let reclen = dirent_record_len(name_len);
            assert_eq!(reclen % DIRENT_ALIGN, 0);
            assert!(reclen >= DIRENT_HEADER_LEN + name_len + 1);
            assert!(reclen < DIRENT_HEADER_LEN + name_len + 1 + DIRENT_ALIGN);
        }
    }

    #[test]
    fn packed_records_can_be_walked_by_length() {
        let mut buf = [0xaau8; 128];
        let first = write_dirent(&mut buf, 1, 8, b"alpha").unwrap();
        let second = write_dirent(&mut buf[first..], 2, 4, b"b").unwrap();

        let entries: Vec<_> = DirentIter::new(&buf[..first + second])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"alpha");
        assert_eq!(entries[0].reclen, first);
        assert_eq!((entries[1].cookie, entries[1].d_type), (2, 4));
        // padding after the name is zeroed
        assert!(buf[DIRENT_HEADER_LEN + 5..first].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_record_is_not_written() {
        let mut buf = [0u8; 16];
        assert_eq!(write_dirent(&mut buf, 1, 8, b"name"), None);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
