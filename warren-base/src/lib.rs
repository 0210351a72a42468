//! Base types for warren.
//!
//! Everything in here is a small, copyable value type used as a map key or
//! wire handle by the higher layers: [`ContentId`] addresses an immutable
//! blob in the content-addressed store, [`ChannelKey`] names the public
//! identity of a followed channel.

pub mod cid;
pub mod key;

pub use self::cid::ContentId;
pub use self::key::ChannelKey;
