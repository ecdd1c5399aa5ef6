#![allow(dead_code)]

#[macro_use]
pub mod log_macros;

pub mod alloc;
pub mod block_run;
pub mod btree;
pub mod cache;
pub mod device;
pub mod error;
pub mod fsck;
pub mod index;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod query;
pub mod small_data;
pub mod superblock;
pub mod sync;
pub mod time;
pub mod volume;

pub use error::{Error, Result};
pub use volume::Volume;
