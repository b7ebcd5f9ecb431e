//! Raw string manipulation of the framing formats used by the register file
//! and the server control protocol. Kept as hand-rolled parsers rather than
//! `serde` because the wire formats are ad-hoc comma/space-delimited text
//! with no schema — but each grammar is isolated in its own function here
//! instead of inlined at the call site, and returns a typed sequence.

use crate::model::RegisteredEntry;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// One group parsed out of the server's `dw-usageinfo` field (or about to be
/// serialized into the outbound usage payload): zero or more package names
/// sharing one quota bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageGroup {
    pub packages: Vec<String>,
    pub quota_kib: u64,
}

/// Package names shorter than this are discarded as noise.
const MIN_PACKAGE_NAME_LEN: usize = 5;

pub mod register {
    //! `QuotaStore` wire format:
    //! `<package> <uid> <gid> <quotaKiB>,` repeated, comma-terminated
    //! including the last entry, fields space-separated, no escaping.

    use super::*;

    pub fn serialize(entries: &[RegisteredEntry]) -> String {
        let mut out = String::new();

        for e in entries {
            out.push_str(&e.package);
            out.push(' ');
            out.push_str(&e.uid.to_string());
            out.push(' ');
            out.push_str(&e.gid.to_string());
            out.push(' ');
            out.push_str(&e.reported_kib().to_string());
            out.push(',');
        }

        out
    }

    /// Parses the register wire format. A malformed record drops the whole
    /// string to an empty set rather than a partial result — the
    /// device is allowed to re-learn state from the server.
    pub fn parse(s: &str) -> Vec<RegisteredEntry> {
        let mut entries = Vec::new();

        for record in s.split(',') {
            let record = record.trim();
            if record.is_empty() {
                continue;
            }

            match parse_record(record) {
                Some(entry) => entries.push(entry),
                None => return Vec::new(),
            }
        }

        entries
    }

    fn parse_record(record: &str) -> Option<RegisteredEntry> {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 4 {
            return None;
        }

        Some(RegisteredEntry {
            package: fields[0].to_owned(),
            uid: fields[1].parse().ok()?,
            gid: fields[2].parse().ok()?,
            quota_kib: fields[3].parse().ok()?,
            remaining_kib: None,
            // The wire format carries no anchor bit; the engine assigns
            // it during rehydrate once entries are grouped by gid.
            anchor: false,
        })
    }
}

/// Grammar shared by `dw-usageinfo` (`new`/`add`/`rem`) and the outbound
/// usage payload:
/// `pkg1 [pkg2 …] <quotaKiB>,pkg1 [pkg2 …] <quotaKiB>,…`
/// Leading whitespace is trimmed; a comma-delimited record is a group: zero
/// or more package names followed by one integer quota. Malformed records
/// are dropped individually rather than aborting the whole parse — a
/// malformed record is silently dropped.
pub fn parse_usageinfo(s: &str) -> Vec<UsageGroup> {
    let mut groups = Vec::new();

    for record in s.trim_start().split(',') {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }

        let mut fields: Vec<&str> = record.split_whitespace().collect();
        let quota_str = match fields.pop() {
            Some(q) => q,
            None => continue,
        };

        let quota_kib: u64 = match quota_str.parse() {
            Ok(q) => q,
            Err(_) => continue,
        };

        let packages: Vec<String> = fields
            .into_iter()
            .filter(|p| p.len() >= MIN_PACKAGE_NAME_LEN)
            .map(|p| p.to_owned())
            .collect();

        groups.push(UsageGroup {
            packages,
            quota_kib,
        });
    }

    groups
}

/// Builds the outbound usage payload: for each gid present in `Registered`,
/// all package names sharing it (space-separated) followed by the anchor's
/// remaining-quota value, comma-terminated.
pub fn build_usage_payload<'a, I>(groups: I) -> String
where
    I: IntoIterator<Item = (&'a [String], u64)>,
{
    let mut out = String::new();

    for (packages, remaining_kib) in groups {
        for pkg in packages {
            out.push_str(pkg);
            out.push(' ');
        }
        out.push_str(&remaining_kib.to_string());
        out.push(',');
    }

    out
}

/// Fixed reserved-character table for the `clientid`/`data`/`brand`/`model`
/// form fields: matches the reserved set of
/// `application/x-www-form-urlencoded`. Characters outside the table pass
/// through unchanged — this is deliberately not a full percent-encoder.
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }

    out
}

/// `configdata` is RFC 4648 standard base64 (the device's historical `cd64`
/// decode table is a fast array-indexed lookup for the very same
/// `ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/`
/// alphabet, offset by its own ASCII-43 base — not a distinct alphabet).
/// Decodes into comma-separated `serial,brand,model`.
pub fn decode_configdata(encoded: &str) -> Option<(String, String, String)> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(bytes).ok()?;

    let mut parts = text.splitn(3, ',');
    let serial = parts.next()?.to_owned();
    let brand = parts.next()?.to_owned();
    let model = parts.next()?.to_owned();

    Some((serial, brand, model))
}

/// Serial is accepted only if it is exactly 16 bytes and contains `P314`.
pub fn is_valid_serial(serial: &str) -> bool {
    serial.len() == 16 && serial.contains("P314")
}
