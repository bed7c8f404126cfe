use bytes::Bytes;

use crate::hash::Hash;

/// an immutable file content object
///
/// `hash` is the source-control object id; the SHA-1 of the contents may
/// differ from it depending on the backing repository's id scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    contents: Bytes,
}

impl Blob {
    pub fn new(hash: Hash, contents: impl Into<Bytes>) -> Self {
        Self {
            hash,
            contents: contents.into(),
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// SHA-1 of the contents (not necessarily equal to `hash`)
    pub fn sha1(&self) -> Hash {
        Hash::sha1_of(&self.contents)
    }

    /// zero-copy slice of the contents; reads past the end return empty
    pub fn slice(&self, offset: u64, size: usize) -> Bytes {
        let len = self.contents.len() as u64;
        if offset >= len {
            return Bytes::new();
        }
        let start = offset as usize;
        let end = start.saturating_add(size).min(self.contents.len());
        self.contents.slice(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_in_bounds() {
        let blob = Blob::new(Hash::ZERO, &b"hello world"[..]);
        assert_eq!(blob.slice(0, 5), Bytes::from_static(b"hello"));
        assert_eq!(blob.slice(6, 100), Bytes::from_static(b"world"));
    }

    #[test]
    fn test_slice_past_end_is_empty() {
        let blob = Blob::new(Hash::ZERO, &b"abc"[..]);
        assert!(blob.slice(3, 1).is_empty());
        assert!(blob.slice(100, 10).is_empty());
    }

    #[test]
    fn test_sha1_differs_from_object_id() {
        let id = Hash::from_hex("3a8f8eb91101860fd8484154885838bf322964d0").unwrap();
        let blob = Blob::new(id, &b"hello\n"[..]);
        assert_eq!(blob.hash(), &id);
        assert_eq!(
            blob.sha1().to_hex(),
            "f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }
}
