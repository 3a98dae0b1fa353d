//! `.hxe` image loader
//!
//! Parses and validates the on-disk bytecode format: a fixed big-endian
//! header (32 bytes for v1, 96 for v2), code and rodata sections, and for
//! v2 a table of metadata sections (`.value`, `.cmd`, `.mailbox`) plus a
//! shared string pool. CRC32 (polynomial 0x04C11DB7) covers the header
//! prefix, code, rodata, and metadata bytes.

use thiserror::Error;

/// Four-byte magic tag at offset 0.
pub const MAGIC: &[u8; 4] = b"HSXE";

/// v1 header size in bytes.
pub const HEADER_V1_LEN: usize = 32;
/// v2 header size in bytes.
pub const HEADER_V2_LEN: usize = 96;

/// Header flag bit: more than one instance of this app may run at once.
pub const FLAG_ALLOW_MULTIPLE_INSTANCES: u16 = 0x0001;

/// Code + rodata must fit below the default rodata/bss ceiling.
pub const MAX_CODE_RO: usize = 56 * 1024;
/// Total metadata section bytes.
pub const MAX_METADATA: usize = 256 * 1024;
/// Metadata string pool bytes.
pub const MAX_STRING_POOL: usize = 64 * 1024;

const SECTION_VALUE: u16 = 1;
const SECTION_CMD: u16 = 2;
const SECTION_MAILBOX: u16 = 3;
const SECTION_STRINGS: u16 = 4;

const SECTION_ENTRY_LEN: usize = 16;
const VALUE_ENTRY_LEN: usize = 20;
const CMD_ENTRY_LEN: usize = 16;
const MAILBOX_ENTRY_LEN: usize = 16;

/// Loader failure. `wire_code` gives the stable control-protocol string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("code/rodata length not word aligned")]
    BadAlignment,
    #[error("entry point 0x{0:x} outside code")]
    EntryOutOfRange(u32),
    #[error("image truncated")]
    Truncated,
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("duplicate metadata: {0}")]
    DuplicateMetadata(String),
    #[error("metadata exceeds size cap")]
    MetadataTooLarge,
    #[error("code + rodata exceeds {MAX_CODE_RO} bytes")]
    ImageTooLarge,
    #[error("metadata section overlaps code or rodata")]
    SectionOverlap,
    #[error("unknown metadata section type {0}")]
    UnknownSection(u16),
}

impl LoadError {
    /// Stable error string surfaced over the control protocol.
    pub fn wire_code(&self) -> String {
        match self {
            LoadError::BadMagic => "bad_magic".into(),
            LoadError::UnsupportedVersion(n) => format!("unsupported_version:{n}"),
            LoadError::BadAlignment => "bad_alignment".into(),
            LoadError::EntryOutOfRange(_) => "entry_out_of_range".into(),
            LoadError::Truncated => "truncated".into(),
            LoadError::CrcMismatch { .. } => "crc_mismatch".into(),
            LoadError::DuplicateMetadata(_) => "duplicate_metadata".into(),
            LoadError::MetadataTooLarge => "metadata_too_large".into(),
            LoadError::ImageTooLarge => "image_too_large".into(),
            LoadError::SectionOverlap => "section_overlap".into(),
            LoadError::UnknownSection(_) => "unknown_section".into(),
        }
    }
}

/// One `.value` metadata entry (20 bytes on disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDef {
    pub group: u8,
    pub value_id: u8,
    pub flags: u8,
    pub auth_level: u8,
    pub init_half: u16,
    pub name_off: u16,
    pub unit_off: u16,
    pub epsilon_half: u16,
    pub min_half: u16,
    pub max_half: u16,
    pub persist_key: u16,
}

impl ValueDef {
    pub fn oid(&self) -> u16 {
        ((self.group as u16) << 8) | self.value_id as u16
    }
}

/// One `.cmd` metadata entry (16 bytes on disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdDef {
    pub group: u8,
    pub cmd_id: u8,
    pub flags: u8,
    pub auth_level: u8,
    pub handler_off: u32,
    pub name_off: u16,
    pub help_off: u16,
}

impl CmdDef {
    pub fn oid(&self) -> u16 {
        ((self.group as u16) << 8) | self.cmd_id as u16
    }
}

/// One `.mailbox` metadata entry (16 bytes on disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxDef {
    pub target_off: u16,
    /// Queue depth; 0 selects the default capacity (64).
    pub depth: u16,
    pub mode_flags: u32,
}

/// Parsed, validated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HxeImage {
    pub version: u16,
    pub flags: u16,
    pub entry: u32,
    pub bss_size: u32,
    pub req_caps: u32,
    /// v2 only; trailing whitespace stripped, at most 31 bytes.
    pub app_name: Option<String>,
    pub code: Vec<u8>,
    pub rodata: Vec<u8>,
    pub values: Vec<ValueDef>,
    pub commands: Vec<CmdDef>,
    pub mailboxes: Vec<MailboxDef>,
    pub string_pool: Vec<u8>,
}

impl HxeImage {
    pub fn allows_multiple_instances(&self) -> bool {
        self.flags & FLAG_ALLOW_MULTIPLE_INSTANCES != 0
    }

    /// NUL-terminated string at `off` in the metadata string pool.
    pub fn pool_str(&self, off: u16) -> Option<&str> {
        pool_str(&self.string_pool, off)
    }

    /// Parse and fully validate an image, including its CRC.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_V1_LEN {
            return Err(LoadError::Truncated);
        }
        if &bytes[0..4] != MAGIC {
            return Err(LoadError::BadMagic);
        }
        let version = be16(bytes, 0x04);
        if version != 1 && version != 2 {
            return Err(LoadError::UnsupportedVersion(version));
        }
        let header_len = if version == 1 { HEADER_V1_LEN } else { HEADER_V2_LEN };
        if bytes.len() < header_len {
            return Err(LoadError::Truncated);
        }

        let flags = be16(bytes, 0x06);
        let entry = be32(bytes, 0x08);
        let code_len = be32(bytes, 0x0C) as usize;
        let ro_len = be32(bytes, 0x10) as usize;
        let bss_size = be32(bytes, 0x14);
        let req_caps = be32(bytes, 0x18);
        let stored_crc = be32(bytes, 0x1C);

        if code_len % 4 != 0 || ro_len % 4 != 0 {
            return Err(LoadError::BadAlignment);
        }
        if code_len + ro_len > MAX_CODE_RO {
            return Err(LoadError::ImageTooLarge);
        }
        if (entry as usize) >= code_len {
            return Err(LoadError::EntryOutOfRange(entry));
        }

        let code_start = header_len;
        let ro_start = code_start + code_len;
        let ro_end = ro_start + ro_len;
        if bytes.len() < ro_end {
            return Err(LoadError::Truncated);
        }

        let mut app_name = None;
        let mut meta_offset = 0usize;
        let mut meta_count = 0usize;
        if version == 2 {
            let raw = &bytes[0x20..0x40];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(31).min(31);
            let name = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();
            app_name = Some(name);
            meta_offset = be32(bytes, 0x40) as usize;
            meta_count = be32(bytes, 0x44) as usize;
        }

        let mut values = Vec::new();
        let mut commands = Vec::new();
        let mut mailboxes = Vec::new();
        let mut string_pool = Vec::new();
        let mut meta_bytes: Vec<u8> = Vec::new();

        if meta_count > 0 {
            if meta_offset < ro_end {
                return Err(LoadError::SectionOverlap);
            }
            let table_end = meta_offset
                .checked_add(meta_count * SECTION_ENTRY_LEN)
                .ok_or(LoadError::Truncated)?;
            if bytes.len() < table_end {
                return Err(LoadError::Truncated);
            }
            meta_bytes.extend_from_slice(&bytes[meta_offset..table_end]);

            let mut meta_total = table_end - meta_offset;
            for i in 0..meta_count {
                let at = meta_offset + i * SECTION_ENTRY_LEN;
                let sec_type = be16(bytes, at);
                let sec_off = be32(bytes, at + 4) as usize;
                let sec_size = be32(bytes, at + 8) as usize;
                let entry_count = be32(bytes, at + 12) as usize;

                if sec_off < ro_end {
                    return Err(LoadError::SectionOverlap);
                }
                let sec_end = sec_off.checked_add(sec_size).ok_or(LoadError::Truncated)?;
                if bytes.len() < sec_end {
                    return Err(LoadError::Truncated);
                }
                meta_total += sec_size;
                if meta_total > MAX_METADATA {
                    return Err(LoadError::MetadataTooLarge);
                }
                let sec = &bytes[sec_off..sec_end];
                meta_bytes.extend_from_slice(sec);

                match sec_type {
                    SECTION_VALUE => {
                        if sec_size < entry_count * VALUE_ENTRY_LEN {
                            return Err(LoadError::Truncated);
                        }
                        for n in 0..entry_count {
                            values.push(parse_value(&sec[n * VALUE_ENTRY_LEN..]));
                        }
                    }
                    SECTION_CMD => {
                        if sec_size < entry_count * CMD_ENTRY_LEN {
                            return Err(LoadError::Truncated);
                        }
                        for n in 0..entry_count {
                            commands.push(parse_cmd(&sec[n * CMD_ENTRY_LEN..]));
                        }
                    }
                    SECTION_MAILBOX => {
                        if sec_size < entry_count * MAILBOX_ENTRY_LEN {
                            return Err(LoadError::Truncated);
                        }
                        for n in 0..entry_count {
                            mailboxes.push(parse_mailbox(&sec[n * MAILBOX_ENTRY_LEN..]));
                        }
                    }
                    SECTION_STRINGS => {
                        if sec_size > MAX_STRING_POOL {
                            return Err(LoadError::MetadataTooLarge);
                        }
                        string_pool = sec.to_vec();
                    }
                    other => return Err(LoadError::UnknownSection(other)),
                }
            }
        }

        // Duplicate detection before CRC so metadata conflicts surface even
        // on images assembled with a stale checksum.
        let mut seen = std::collections::HashSet::new();
        for v in &values {
            if !seen.insert(("value", v.oid())) {
                return Err(LoadError::DuplicateMetadata(format!(
                    "value {}:{}",
                    v.group, v.value_id
                )));
            }
        }
        for c in &commands {
            if !seen.insert(("cmd", c.oid())) {
                return Err(LoadError::DuplicateMetadata(format!(
                    "cmd {}:{}",
                    c.group, c.cmd_id
                )));
            }
        }
        let mut targets = std::collections::HashSet::new();
        for m in &mailboxes {
            let name = pool_str(&string_pool, m.target_off).unwrap_or_default().to_string();
            if !targets.insert(name.clone()) {
                return Err(LoadError::DuplicateMetadata(format!("mailbox {name}")));
            }
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[0..0x1C]);
        hasher.update(&bytes[code_start..ro_end]);
        hasher.update(&meta_bytes);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(LoadError::CrcMismatch { stored: stored_crc, computed });
        }

        Ok(HxeImage {
            version,
            flags,
            entry,
            bss_size,
            req_caps,
            app_name,
            code: bytes[code_start..ro_start].to_vec(),
            rodata: bytes[ro_start..ro_end].to_vec(),
            values,
            commands,
            mailboxes,
            string_pool,
        })
    }

    /// Serialise back to the on-disk layout; exact inverse of `parse`.
    pub fn encode(&self) -> Vec<u8> {
        let header_len = if self.version == 1 { HEADER_V1_LEN } else { HEADER_V2_LEN };
        let mut sections: Vec<(u16, Vec<u8>, u32)> = Vec::new();
        if !self.values.is_empty() {
            let mut buf = Vec::new();
            for v in &self.values {
                buf.push(v.group);
                buf.push(v.value_id);
                buf.push(v.flags);
                buf.push(v.auth_level);
                buf.extend_from_slice(&v.init_half.to_be_bytes());
                buf.extend_from_slice(&v.name_off.to_be_bytes());
                buf.extend_from_slice(&v.unit_off.to_be_bytes());
                buf.extend_from_slice(&v.epsilon_half.to_be_bytes());
                buf.extend_from_slice(&v.min_half.to_be_bytes());
                buf.extend_from_slice(&v.max_half.to_be_bytes());
                buf.extend_from_slice(&v.persist_key.to_be_bytes());
                buf.extend_from_slice(&[0, 0]);
            }
            sections.push((SECTION_VALUE, buf, self.values.len() as u32));
        }
        if !self.commands.is_empty() {
            let mut buf = Vec::new();
            for c in &self.commands {
                buf.push(c.group);
                buf.push(c.cmd_id);
                buf.push(c.flags);
                buf.push(c.auth_level);
                buf.extend_from_slice(&c.handler_off.to_be_bytes());
                buf.extend_from_slice(&c.name_off.to_be_bytes());
                buf.extend_from_slice(&c.help_off.to_be_bytes());
                buf.extend_from_slice(&[0, 0, 0, 0]);
            }
            sections.push((SECTION_CMD, buf, self.commands.len() as u32));
        }
        if !self.mailboxes.is_empty() {
            let mut buf = Vec::new();
            for m in &self.mailboxes {
                buf.extend_from_slice(&m.target_off.to_be_bytes());
                buf.extend_from_slice(&m.depth.to_be_bytes());
                buf.extend_from_slice(&m.mode_flags.to_be_bytes());
                buf.extend_from_slice(&[0; 8]);
            }
            sections.push((SECTION_MAILBOX, buf, self.mailboxes.len() as u32));
        }
        if !self.string_pool.is_empty() {
            sections.push((SECTION_STRINGS, self.string_pool.clone(), 0));
        }

        let meta_count = if self.version == 2 { sections.len() } else { 0 };
        let ro_end = header_len + self.code.len() + self.rodata.len();
        let meta_offset = if meta_count > 0 { ro_end } else { 0 };

        // Lay out section payloads after the table.
        let table_len = meta_count * SECTION_ENTRY_LEN;
        let mut payload = Vec::new();
        let mut table = Vec::new();
        for (sec_type, buf, entry_count) in &sections {
            let off = meta_offset + table_len + payload.len();
            table.extend_from_slice(&sec_type.to_be_bytes());
            table.extend_from_slice(&[0, 0]);
            table.extend_from_slice(&(off as u32).to_be_bytes());
            table.extend_from_slice(&(buf.len() as u32).to_be_bytes());
            table.extend_from_slice(&entry_count.to_be_bytes());
            payload.extend_from_slice(buf);
        }

        let mut out = Vec::with_capacity(ro_end + table.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.entry.to_be_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.rodata.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.bss_size.to_be_bytes());
        out.extend_from_slice(&self.req_caps.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // crc placeholder
        if self.version == 2 {
            let mut name = [0u8; 32];
            if let Some(n) = &self.app_name {
                let b = n.as_bytes();
                let len = b.len().min(31);
                name[..len].copy_from_slice(&b[..len]);
            }
            out.extend_from_slice(&name);
            out.extend_from_slice(&(meta_offset as u32).to_be_bytes());
            out.extend_from_slice(&(meta_count as u32).to_be_bytes());
            out.extend_from_slice(&[0u8; HEADER_V2_LEN - 0x48]);
        }
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.rodata);
        out.extend_from_slice(&table);
        out.extend_from_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[0..0x1C]);
        hasher.update(&out[header_len..header_len + self.code.len() + self.rodata.len()]);
        hasher.update(&table);
        hasher.update(&payload);
        let crc = hasher.finalize();
        out[0x1C..0x20].copy_from_slice(&crc.to_be_bytes());
        out
    }
}

fn pool_str(pool: &[u8], off: u16) -> Option<&str> {
    let start = off as usize;
    if start >= pool.len() {
        return None;
    }
    let end = pool[start..].iter().position(|&b| b == 0)? + start;
    std::str::from_utf8(&pool[start..end]).ok()
}

fn parse_value(b: &[u8]) -> ValueDef {
    ValueDef {
        group: b[0],
        value_id: b[1],
        flags: b[2],
        auth_level: b[3],
        init_half: be16(b, 4),
        name_off: be16(b, 6),
        unit_off: be16(b, 8),
        epsilon_half: be16(b, 10),
        min_half: be16(b, 12),
        max_half: be16(b, 14),
        persist_key: be16(b, 16),
    }
}

fn parse_cmd(b: &[u8]) -> CmdDef {
    CmdDef {
        group: b[0],
        cmd_id: b[1],
        flags: b[2],
        auth_level: b[3],
        handler_off: be32(b, 4),
        name_off: be16(b, 8),
        help_off: be16(b, 10),
    }
}

fn parse_mailbox(b: &[u8]) -> MailboxDef {
    MailboxDef {
        target_off: be16(b, 0),
        depth: be16(b, 2),
        mode_flags: be32(b, 4),
    }
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Build a string pool from unique strings, returning (pool, offsets).
pub fn build_string_pool(strings: &[&str]) -> (Vec<u8>, Vec<u16>) {
    let mut pool = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        // Dedup exact repeats.
        let existing = offsets
            .iter()
            .zip(strings.iter())
            .find(|(_, prev)| **prev == *s)
            .map(|(off, _)| *off);
        if let Some(off) = existing {
            offsets.push(off);
            continue;
        }
        offsets.push(pool.len() as u16);
        pool.extend_from_slice(s.as_bytes());
        pool.push(0);
    }
    (pool, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_v1() -> HxeImage {
        HxeImage {
            version: 1,
            flags: 0,
            entry: 0,
            bss_size: 0,
            req_caps: 0,
            app_name: None,
            code: vec![0; 8],
            rodata: vec![],
            values: vec![],
            commands: vec![],
            mailboxes: vec![],
            string_pool: vec![],
        }
    }

    #[test]
    fn test_v1_roundtrip_empty_rodata() {
        let img = minimal_v1();
        let bytes = img.encode();
        let parsed = HxeImage::parse(&bytes).unwrap();
        assert_eq!(parsed, img);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = minimal_v1().encode();
        bytes[0] = b'X';
        assert_eq!(HxeImage::parse(&bytes), Err(LoadError::BadMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = minimal_v1().encode();
        bytes[5] = 3;
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(LoadError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn test_crc_flip_detected() {
        let mut bytes = minimal_v1().encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(LoadError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_entry_out_of_range() {
        let mut img = minimal_v1();
        img.entry = 8;
        let bytes = img.encode();
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(LoadError::EntryOutOfRange(8))
        ));
    }

    #[test]
    fn test_v2_app_name_and_meta() {
        let (pool, offs) = build_string_pool(&["app:telemetry"]);
        let img = HxeImage {
            version: 2,
            flags: FLAG_ALLOW_MULTIPLE_INSTANCES,
            entry: 0,
            bss_size: 16,
            req_caps: 0,
            app_name: Some("demo".into()),
            code: vec![0; 4],
            rodata: vec![1, 2, 3, 4],
            values: vec![ValueDef {
                group: 1,
                value_id: 3,
                flags: 0,
                auth_level: 0,
                init_half: 0,
                name_off: 0,
                unit_off: 0,
                epsilon_half: 0,
                min_half: 0,
                max_half: 0,
                persist_key: 0,
            }],
            commands: vec![],
            mailboxes: vec![MailboxDef {
                target_off: offs[0],
                depth: 0,
                mode_flags: 0,
            }],
            string_pool: pool,
        };
        let parsed = HxeImage::parse(&img.encode()).unwrap();
        assert_eq!(parsed.app_name.as_deref(), Some("demo"));
        assert!(parsed.allows_multiple_instances());
        assert_eq!(parsed.values[0].oid(), 0x0103);
        assert_eq!(parsed.pool_str(parsed.mailboxes[0].target_off), Some("app:telemetry"));
    }

    #[test]
    fn test_v2_meta_count_zero() {
        let mut img = minimal_v1();
        img.version = 2;
        img.app_name = Some(String::new());
        let parsed = HxeImage::parse(&img.encode()).unwrap();
        assert!(parsed.values.is_empty());
        assert!(parsed.mailboxes.is_empty());
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let v = ValueDef {
            group: 1,
            value_id: 1,
            flags: 0,
            auth_level: 0,
            init_half: 0,
            name_off: 0,
            unit_off: 0,
            epsilon_half: 0,
            min_half: 0,
            max_half: 0,
            persist_key: 0,
        };
        let mut img = minimal_v1();
        img.version = 2;
        img.app_name = Some("d".into());
        img.values = vec![v.clone(), v];
        assert!(matches!(
            HxeImage::parse(&img.encode()),
            Err(LoadError::DuplicateMetadata(_))
        ));
    }

    #[test]
    fn test_unaligned_code_rejected() {
        // Hand-build a header with code_len = 6.
        let mut img = minimal_v1();
        img.code = vec![0; 6];
        let bytes = img.encode();
        assert_eq!(HxeImage::parse(&bytes), Err(LoadError::BadAlignment));
    }
}
