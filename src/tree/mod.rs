//! Copy-on-write B+tree and its page layouts

pub mod cow;
pub mod item_page;
pub mod key;
pub mod node;

pub use cow::{CowTree, Transaction, TreeIter, Version};
pub use key::{PostingKey, TreeKey, TreeValue};
