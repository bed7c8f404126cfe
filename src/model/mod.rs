mod blob;
mod git;
mod tree;

pub use blob::Blob;
pub use git::{deserialize_tree, serialize_tree};
pub use tree::{FileType, Tree, TreeEntry};
