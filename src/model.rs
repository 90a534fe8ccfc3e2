//! Core data model.
//!
//! An item is what the queue transport stores: the job's class, its
//! arguments, and the metadata map the instrumentation carries across
//! process boundaries.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Open, string-keyed metadata map carried inside a queued item.
///
/// Keys are always `String`; this is the one canonical key representation
/// used everywhere metadata is built, merged, or published.
pub type Metadata = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A queued job payload as persisted by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireItem", into = "WireItem")]
pub struct Item {
    /// Identifies the job type (which handler performs it).
    pub worker_class: String,

    /// Ordered job arguments. Opaque to the instrumentation.
    pub args: Vec<Value>,

    /// Observability metadata. Absent on items enqueued without
    /// instrumentation.
    pub metadata: Option<Metadata>,

    /// Any other top-level payload fields. Passed through untouched so third
    /// parties consuming the same queue see their data unchanged.
    pub extra: serde_json::Map<String, Value>,

    /// The stored payload said `"metadata": null`; written back the same way
    /// while no metadata is set.
    null_metadata: bool,
}

/// On-the-wire shape of an [`Item`]. `metadata` distinguishes a missing key
/// (`None`) from an explicit null (`Some(None)`).
#[derive(Serialize, Deserialize)]
struct WireItem {
    worker_class: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    metadata: Option<Option<Metadata>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<Metadata>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Metadata>::deserialize(deserializer).map(Some)
}

impl From<WireItem> for Item {
    fn from(wire: WireItem) -> Self {
        Self {
            worker_class: wire.worker_class,
            args: wire.args,
            null_metadata: matches!(wire.metadata, Some(None)),
            metadata: wire.metadata.flatten(),
            extra: wire.extra,
        }
    }
}

impl From<Item> for WireItem {
    fn from(item: Item) -> Self {
        let metadata = match item.metadata {
            Some(metadata) => Some(Some(metadata)),
            None if item.null_metadata => Some(None),
            None => None,
        };
        Self {
            worker_class: item.worker_class,
            args: item.args,
            metadata,
            extra: item.extra,
        }
    }
}

impl Item {
    pub fn new(worker_class: impl Into<String>) -> Self {
        Self {
            worker_class: worker_class.into(),
            args: Vec::new(),
            metadata: None,
            extra: serde_json::Map::new(),
            null_metadata: false,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Whether this item was stamped by the instrumentation at enqueue time.
    pub fn is_instrumented(&self) -> bool {
        self.metadata.is_some()
    }

    /// Does this item match a `destroy` selector?
    ///
    /// `args` of `None` matches every item of the class.
    pub fn matches(&self, worker_class: &str, args: Option<&[Value]>) -> bool {
        self.worker_class == worker_class && args.is_none_or(|args| self.args == args)
    }
}
