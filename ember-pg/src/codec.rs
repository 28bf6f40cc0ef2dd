//! Frame encoding and decoding for the simple query protocol.
//!
//! Encoders append a complete frame to the caller's buffer; decoders operate
//! on a message body (the bytes after the 1-byte tag and 4-byte length).

const PROTOCOL_VERSION: i32 = 196608; // 3.0

/// Returns the total length of the first complete message in `buf`
/// (tag byte included), or `None` if more bytes are needed.
pub fn message_complete(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let len = read_i32(buf, 1) as usize;
    let total = 1 + len;
    if buf.len() >= total { Some(total) } else { None }
}

pub fn read_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_be_bytes([buf[off], buf[off + 1]])
}

pub fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Reads a NUL-terminated string starting at `off`; returns the string and
/// the offset just past the terminator.
pub fn read_cstring(buf: &[u8], off: usize) -> (String, usize) {
    let end = buf[off..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| off + p)
        .unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[off..end]).into_owned();
    (s, (end + 1).min(buf.len()))
}

fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Patches the length field of a frame whose length starts at `len_at`.
/// The length covers itself and everything after it.
fn patch_len(buf: &mut Vec<u8>, len_at: usize) {
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

/// StartupMessage: no tag byte, protocol version, then key/value pairs.
pub fn encode_startup(buf: &mut Vec<u8>, user: &str, database: &str) {
    let start = buf.len();
    push_i32(buf, 0);
    push_i32(buf, PROTOCOL_VERSION);
    push_cstring(buf, "user");
    push_cstring(buf, user);
    push_cstring(buf, "database");
    push_cstring(buf, database);
    buf.push(0);
    patch_len(buf, start);
}

/// PasswordMessage ('p').
pub fn encode_password(buf: &mut Vec<u8>, password: &str) {
    buf.push(b'p');
    let len_at = buf.len();
    push_i32(buf, 0);
    push_cstring(buf, password);
    patch_len(buf, len_at);
}

/// Query ('Q') — simple query protocol.
pub fn encode_query(buf: &mut Vec<u8>, sql: &str) {
    buf.push(b'Q');
    let len_at = buf.len();
    push_i32(buf, 0);
    push_cstring(buf, sql);
    patch_len(buf, len_at);
}

/// Terminate ('X').
pub fn encode_terminate(buf: &mut Vec<u8>) {
    buf.push(b'X');
    push_i32(buf, 4);
}

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: i32,
}

/// Parses a RowDescription body into its column descriptions.
pub fn parse_row_description(body: &[u8]) -> Vec<ColumnDesc> {
    let count = read_i16(body, 0) as usize;
    let mut cols = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        let (name, next) = read_cstring(body, off);
        off = next;
        let type_oid = read_i32(body, off + 6);
        // table oid (4) + attnum (2) + type oid (4) + typlen (2) + typmod (4) + format (2)
        off += 18;
        cols.push(ColumnDesc { name, type_oid });
    }
    cols
}

/// Parses a DataRow body into per-column raw values (`None` = SQL NULL).
pub fn parse_data_row(body: &[u8]) -> Vec<Option<Vec<u8>>> {
    let count = read_i16(body, 0) as usize;
    let mut values = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        let len = read_i32(body, off);
        off += 4;
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            values.push(Some(body[off..off + len].to_vec()));
            off += len;
        }
    }
    values
}

/// Parses ErrorResponse/NoticeResponse fields: (type byte, value) pairs.
pub fn parse_error_fields(body: &[u8]) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    let mut off = 0;
    while off < body.len() && body[off] != 0 {
        let ty = body[off];
        let (value, next) = read_cstring(body, off + 1);
        fields.push((ty, value));
        off = next;
    }
    fields
}

/// Extracts the affected-row count from a CommandComplete tag such as
/// `INSERT 0 1`, `UPDATE 3` or `SELECT 2`.
pub fn parse_command_complete(body: &[u8]) -> u64 {
    let (tag, _) = read_cstring(body, 0);
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
