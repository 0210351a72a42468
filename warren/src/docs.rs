//! The channel meta-data tree.
//!
//! A channel is published as a tiny root [`ChannelIndex`] referencing the
//! [`Description`], [`Recommendations`] and [`RecordList`] documents by
//! content id; each [`Record`] in the list references its attachment
//! leaves.  Documents are immutable per content id: any edit republishes
//! the changed document (and everything above it) under a new id, which is
//! what lets the reconciliation engine diff two snapshots by comparing ids
//! alone.
//!
//! The codec here (postcard) is how the engine and its tests move
//! documents through a store; it is not a commitment to any particular
//! wire format.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use warren_base::{ChannelKey, ContentId};

use crate::error::{ProtocolError, UndecodableSnafu};
use crate::limits;

/// A document of the channel meta-data tree.
pub trait Document: Serialize + DeserializeOwned + Sized {
    /// Name used in logs and error contexts.
    const CONTEXT: &'static str;
    /// Ceiling checked before this document type is fetched or pinned.
    const SIZE_LIMIT_BYTES: u64;

    /// Decode a document from its stored bytes.
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|_| {
            UndecodableSnafu {
                context: Self::CONTEXT,
            }
            .build()
        })
    }

    /// Encode a document to its stored bytes.
    fn encode(&self) -> Bytes {
        postcard::to_stdvec(self)
            .expect("document serialization cannot fail")
            .into()
    }
}

/// The root document of a channel.
///
/// All references are optional so that the "never fetched" state can be
/// modeled as an index with nothing in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIndex {
    /// The channel's [`Description`].
    pub description: Option<ContentId>,
    /// The channel's [`Recommendations`].
    pub recommendations: Option<ContentId>,
    /// The channel's [`RecordList`].
    pub records: Option<ContentId>,
}

impl Document for ChannelIndex {
    const CONTEXT: &'static str = "index";
    const SIZE_LIMIT_BYTES: u64 = limits::MAX_INDEX_SIZE_BYTES;
}

/// Who this channel is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Display name.
    pub name: String,
    /// Free-form text.
    pub text: String,
    /// User picture, mirrored as meta-data when present.
    pub picture: Option<ContentId>,
}

impl Document for Description {
    const CONTEXT: &'static str = "description";
    const SIZE_LIMIT_BYTES: u64 = limits::MAX_DESCRIPTION_SIZE_BYTES;
}

/// Other channels this channel recommends.  Opaque to the engine: it is
/// pinned and replaced as a whole, never diffed internally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendations {
    /// Recommended channel keys.
    pub channels: Vec<ChannelKey>,
}

impl Document for Recommendations {
    const CONTEXT: &'static str = "recommendations";
    const SIZE_LIMIT_BYTES: u64 = limits::MAX_META_LIST_SIZE_BYTES;
}

/// The channel's posts, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordList {
    /// Record content ids, oldest first.
    pub records: Vec<ContentId>,
}

impl Document for RecordList {
    const CONTEXT: &'static str = "records";
    const SIZE_LIMIT_BYTES: u64 = limits::MAX_META_LIST_SIZE_BYTES;
}

/// One post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Title of the post.
    pub name: String,
    /// Body text.
    pub text: String,
    /// Publish time in milliseconds since the epoch, as claimed by the
    /// channel.
    pub published_ms: u64,
    /// Thumbnail leaf.
    pub thumbnail: Option<ContentId>,
    /// Media attachments.
    pub attachments: Vec<Leaf>,
}

impl Document for Record {
    const CONTEXT: &'static str = "record";
    const SIZE_LIMIT_BYTES: u64 = limits::MAX_RECORD_SIZE_BYTES;
}

/// One media attachment of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Content id of the media data.
    pub cid: ContentId,
    /// Mime type, used to classify the attachment.
    pub mime: String,
    /// Width in pixels (0 for non-visual media).
    pub width: u32,
    /// Height in pixels (0 for non-visual media).
    pub height: u32,
}

/// A video attachment together with its largest edge, the measure used
/// for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoLeaf {
    /// Content id of the video data.
    pub cid: ContentId,
    /// max(width, height) in pixels.
    pub edge: u32,
}

/// The cacheable leaves of one record, classified by kind.
///
/// A record can carry any number of attachments but the cache only ever
/// mirrors up to two of them: the thumbnail, and one of video-or-audio.
#[derive(Debug, Clone)]
pub struct LeafSet {
    /// The record's thumbnail, if any.
    pub thumbnail: Option<ContentId>,
    /// The last audio attachment, if any.
    pub audio: Option<ContentId>,
    // ascending by edge, so larger videos are at the end
    videos: Vec<VideoLeaf>,
}

impl LeafSet {
    /// Classify the attachments of a record.
    pub fn parse(record: &Record) -> Self {
        let mut audio = None;
        let mut videos = Vec::new();
        for leaf in &record.attachments {
            if leaf.mime.starts_with("video/") {
                videos.push(VideoLeaf {
                    cid: leaf.cid,
                    edge: leaf.width.max(leaf.height),
                });
            } else if leaf.mime.starts_with("audio/") {
                // multiple audio attachments have no defined meaning, the
                // last one wins
                audio = Some(leaf.cid);
            }
        }
        videos.sort_by_key(|v| v.edge);
        Self {
            thumbnail: record.thumbnail,
            audio,
            videos,
        }
    }

    /// The largest video no larger than `max_edge`, or `None` if there are
    /// no videos or they are all too large.
    pub fn largest_video_within(&self, max_edge: u32) -> Option<VideoLeaf> {
        self.videos
            .iter()
            .rev()
            .find(|v| v.edge <= max_edge)
            .copied()
    }
}
