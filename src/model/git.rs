//! git-compatible tree object wire format
//!
//! `"tree <decimal-length>\0"` header followed by concatenated entries
//! `"<octal-mode> <name>\0<20-byte-hash>"`.

use crate::error::{Error, Result};
use crate::hash::{Hash, HASH_LEN};
use crate::model::tree::{tree_name_order, FileType, Tree, TreeEntry};
use crate::path::PathComponent;

const MODE_DIRECTORY: &str = "40000";
const MODE_REGULAR: &str = "100644";
const MODE_EXECUTABLE: &str = "100755";
const MODE_SYMLINK: &str = "120000";

/// serialize entries into a git tree object, sorting them in tree order
pub fn serialize_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        tree_name_order(
            a.name.as_str(),
            a.is_directory(),
            b.name.as_str(),
            b.is_directory(),
        )
    });

    let mut body = Vec::new();
    for entry in sorted {
        let mode = match (entry.file_type, entry.owner_perms & 0b001) {
            (FileType::Directory, _) => MODE_DIRECTORY,
            (FileType::Symlink, _) => MODE_SYMLINK,
            (FileType::Regular, 0) => MODE_REGULAR,
            (FileType::Regular, _) => MODE_EXECUTABLE,
        };
        body.extend_from_slice(mode.as_bytes());
        body.push(b' ');
        body.extend_from_slice(entry.name.as_str().as_bytes());
        body.push(0);
        body.extend_from_slice(entry.hash.as_bytes());
    }

    let mut object = Vec::with_capacity(body.len() + 16);
    object.extend_from_slice(format!("tree {}\0", body.len()).as_bytes());
    object.extend_from_slice(&body);
    object
}

/// deserialize a git tree object
///
/// `hash` is the object id the caller fetched this object under; it becomes
/// the id of the returned tree. Fails with `MalformedObject` on any
/// deviation from the format.
pub fn deserialize_tree(hash: Hash, data: &[u8]) -> Result<Tree> {
    let body = parse_header(data)?;

    let mut entries = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let (entry, remainder) = parse_entry(rest)?;
        entries.push(entry);
        rest = remainder;
    }

    Tree::new(hash, entries)
}

fn parse_header(data: &[u8]) -> Result<&[u8]> {
    let prefix = b"tree ";
    if data.len() < prefix.len() || &data[..prefix.len()] != prefix {
        return Err(malformed("missing 'tree ' header"));
    }
    let after_prefix = &data[prefix.len()..];

    let nul = after_prefix
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("truncated header: no NUL after length"))?;
    let length_str = std::str::from_utf8(&after_prefix[..nul])
        .map_err(|_| malformed("header length is not ascii"))?;
    let declared: usize = length_str
        .parse()
        .map_err(|_| malformed("header length is not decimal"))?;

    let body = &after_prefix[nul + 1..];
    if body.len() != declared {
        return Err(malformed(&format!(
            "declared length {} does not match body length {}",
            declared,
            body.len()
        )));
    }
    Ok(body)
}

fn parse_entry(data: &[u8]) -> Result<(TreeEntry, &[u8])> {
    let space = data
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| malformed("entry missing space after mode"))?;
    let mode_bytes = &data[..space];
    if mode_bytes.is_empty() {
        return Err(malformed("entry has empty mode"));
    }
    for &b in mode_bytes {
        if !(b'0'..=b'7').contains(&b) {
            return Err(malformed(&format!(
                "non-octal digit {:?} in mode",
                b as char
            )));
        }
    }
    let mode = std::str::from_utf8(mode_bytes).expect("octal digits are ascii");
    let (file_type, owner_perms) = match mode {
        MODE_DIRECTORY => (FileType::Directory, 0b111),
        MODE_REGULAR => (FileType::Regular, 0b110),
        MODE_EXECUTABLE => (FileType::Regular, 0b111),
        MODE_SYMLINK => (FileType::Symlink, 0b111),
        other => return Err(malformed(&format!("unrecognized mode {}", other))),
    };

    let after_mode = &data[space + 1..];
    let nul = after_mode
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("entry missing NUL after name"))?;
    let name = std::str::from_utf8(&after_mode[..nul])
        .map_err(|_| malformed("entry name is not valid utf-8"))?;
    let name = PathComponent::new(name)
        .map_err(|e| malformed(&format!("invalid entry name: {}", e)))?;

    let after_name = &after_mode[nul + 1..];
    if after_name.len() < HASH_LEN {
        return Err(malformed("entry truncated before hash"));
    }
    let hash = Hash::from_slice(&after_name[..HASH_LEN]).expect("length checked");

    Ok((
        TreeEntry::new(name, hash, file_type, owner_perms),
        &after_name[HASH_LEN..],
    ))
}

fn malformed(msg: &str) -> Error {
    Error::MalformedObject(msg.to_string())
}
