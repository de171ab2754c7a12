#![doc = include_str!("../README.md")]

mod allocator;
mod block;
pub mod codec;
mod error;
mod policy;
mod pool;
mod requester;
mod runtime;
mod sleep_provider;
mod store;
mod time;

pub use crate::allocator::*;
pub use crate::block::*;
pub use crate::error::*;
pub use crate::policy::*;
pub use crate::pool::*;
pub use crate::requester::*;
#[cfg(any(feature = "async-tokio", feature = "async-smol"))]
pub use crate::runtime::*;
pub use crate::sleep_provider::*;
pub use crate::store::*;
pub use crate::time::*;
