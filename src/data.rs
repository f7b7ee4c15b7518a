use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::parser::ANONYMOUS_WORKER_ID;
pub use crate::types::{ClassificationId, SubjectId, TaskLabel, ToolLabel, WorkerId};

/// Message record exactly as received from a source.
///
/// Kept schema-free so it can be retained and dumped verbatim; typed decoding
/// happens once through [`Classification::from_message`].
pub type RawMessage = Value;

/// A raw message keyed by its `classification_id`.
///
/// Equality and hashing only consider the id, so a `HashSet<UniqueMessage>`
/// never holds two messages for the same classification event.
#[derive(Clone, Debug)]
pub struct UniqueMessage {
    classification_id: ClassificationId,
    message: RawMessage,
}

impl UniqueMessage {
    /// Wrap `message`, returning `None` when it has no usable `classification_id`.
    pub fn new(message: RawMessage) -> Option<Self> {
        let classification_id = classification_id_of(&message)?;
        Some(Self {
            classification_id,
            message,
        })
    }

    /// Identity key of this message.
    pub fn classification_id(&self) -> ClassificationId {
        self.classification_id
    }

    /// Borrow the wrapped raw message.
    pub fn message(&self) -> &RawMessage {
        &self.message
    }

    /// Mutably borrow the wrapped raw message (used for metadata enrichment).
    pub fn message_mut(&mut self) -> &mut RawMessage {
        &mut self.message
    }

    /// Unwrap into the raw message.
    pub fn into_message(self) -> RawMessage {
        self.message
    }
}

impl PartialEq for UniqueMessage {
    fn eq(&self, other: &Self) -> bool {
        self.classification_id == other.classification_id
    }
}

impl Eq for UniqueMessage {}

impl Hash for UniqueMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.classification_id.hash(state);
    }
}

/// Extract the `classification_id` of a raw message (integer or numeric string).
pub fn classification_id_of(message: &RawMessage) -> Option<ClassificationId> {
    message.get("classification_id").and_then(integer_like)
}

/// Interpret a JSON value as an integer when it is integer-like.
///
/// Accepts integers, integral finite floats, and strings holding either.
pub fn integer_like(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && float.fract() == 0.0)
                .map(|float| float as i64)
        }),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|float| float.is_finite() && float.fract() == 0.0)
                    .map(|float| float as i64)
            })
        }
        _ => None,
    }
}

/// Interpret a JSON value as a float (numbers and numeric strings).
pub fn float_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|float| float.is_finite())
}

fn identifier_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(_) => integer_like(value).map(|id| id.to_string()),
        _ => None,
    }
}

/// Wire shape of the `data` envelope of a queue message.
#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    data: MessageData,
    #[serde(default)]
    subject_id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    classification: ClassificationPayload,
}

/// Wire shape of the nested classification payload.
#[derive(Debug, Deserialize)]
struct ClassificationPayload {
    #[serde(default)]
    subject: Option<SubjectPayload>,
    #[serde(default)]
    subject_id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    annotations: Option<Value>,
    #[serde(default)]
    created_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SubjectPayload {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Flattened per-message record used by the annotation parser.
#[derive(Clone, Debug)]
pub struct Classification {
    /// Identity of the classification event.
    pub classification_id: ClassificationId,
    /// Subject the worker annotated.
    pub subject_id: SubjectId,
    /// Worker id; anonymous or unparseable ids become `-99`.
    pub worker_id: WorkerId,
    /// Raw per-task annotation payloads keyed by task label.
    pub annotations: BTreeMap<TaskLabel, Value>,
    /// Subject metadata (size hints, training flags, and so on).
    pub subject_metadata: Map<String, Value>,
    /// Classification-level metadata (client viewport, subject dimensions).
    pub classification_metadata: Map<String, Value>,
    /// Creation timestamp when present and parseable.
    pub created_at: Option<DateTime<Utc>>,
}

impl Classification {
    /// Decode the classification payload of `message`.
    ///
    /// Returns `None` when the payload is structurally malformed (no
    /// `data.classification` object, or no subject identity).
    pub fn from_message(message: &UniqueMessage) -> Option<Self> {
        let envelope = MessageEnvelope::deserialize(message.message()).ok()?;
        let payload = envelope.data.classification;
        let (subject_ref_id, subject_metadata) = match payload.subject {
            Some(subject) => (subject.id, subject.metadata),
            None => (None, None),
        };
        let subject_id = subject_ref_id
            .as_ref()
            .and_then(identifier_string)
            .or_else(|| payload.subject_id.as_ref().and_then(identifier_string))
            .or_else(|| envelope.subject_id.as_ref().and_then(identifier_string))?;
        let worker_id = payload
            .user_id
            .as_ref()
            .or(envelope.user_id.as_ref())
            .and_then(integer_like)
            .unwrap_or(ANONYMOUS_WORKER_ID);
        let annotations = match payload.annotations {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        let created_at = payload
            .created_at
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .map(|time| time.with_timezone(&Utc));
        Some(Self {
            classification_id: message.classification_id(),
            subject_id,
            worker_id,
            annotations,
            subject_metadata: into_object(subject_metadata),
            classification_metadata: into_object(payload.metadata),
            created_at,
        })
    }

    /// Returns `true` when the annotation payload holds at least one task entry.
    pub fn has_markings(&self) -> bool {
        !self.annotations.is_empty()
    }
}

fn into_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Wire shape of one task entry inside `annotations.<task>`.
#[derive(Debug, Deserialize)]
pub(crate) struct TaskAnnotation {
    #[serde(default)]
    pub(crate) value: Vec<TapValue>,
}

/// Wire shape of one tap inside a task entry.
#[derive(Debug, Deserialize)]
pub(crate) struct TapValue {
    pub(crate) x: f64,
    pub(crate) y: f64,
    #[serde(default)]
    pub(crate) tool: Option<Value>,
}

/// A single tap placed by a worker, with its tool label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub x: f64,
    pub y: f64,
    pub tool: ToolLabel,
}

impl Mark {
    /// Build a mark from pixel coordinates and a tool label.
    pub fn new(x: f64, y: f64, tool: impl Into<ToolLabel>) -> Self {
        Self {
            x,
            y,
            tool: tool.into(),
        }
    }
}

/// Natural pixel dimensions of a subject image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: f64,
    pub height: f64,
}

/// Axis-aligned box centered on a tap, in the engine's field naming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x: f64,
    /// Right edge.
    pub x2: f64,
    /// Top edge.
    pub y: f64,
    /// Bottom edge.
    pub y2: f64,
    /// Natural width of the subject image.
    pub image_width: f64,
    /// Natural height of the subject image.
    pub image_height: f64,
    pub tool: ToolLabel,
}

impl BoundingBox {
    /// Build a `width` x `height` box centered on `mark`.
    pub fn around(mark: &Mark, width: f64, height: f64, image: ImageDimensions) -> Self {
        Self {
            x: mark.x - 0.5 * width,
            x2: mark.x + 0.5 * width,
            y: mark.y - 0.5 * height,
            y2: mark.y + 0.5 * height,
            image_width: image.width,
            image_height: image.height,
            tool: mark.tool.clone(),
        }
    }

    /// Horizontal extent.
    pub fn width(&self) -> f64 {
        self.x2 - self.x
    }

    /// Vertical extent.
    pub fn height(&self) -> f64 {
        self.y2 - self.y
    }
}

/// Image entry of a normalized batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub height: f64,
    pub width: f64,
    pub url: String,
}

/// Boxes contributed by one classification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationBoxes {
    pub bboxes: Vec<BoundingBox>,
}

/// One worker's annotation of one image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub image_id: SubjectId,
    /// Worker id rendered as a string.
    pub worker_id: String,
    pub anno: AnnotationBoxes,
}

/// Per-task batch handed to an aggregation engine.
///
/// `dataset` and `workers` are reserved and always empty on output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub dataset: Map<String, Value>,
    pub workers: Map<String, Value>,
    /// Subject id to image entry, one per subject.
    pub images: IndexMap<SubjectId, ImageInfo>,
    pub annos: Vec<AnnotationEntry>,
}

impl NormalizedBatch {
    /// Returns `true` when the batch carries no annotations.
    pub fn is_empty(&self) -> bool {
        self.annos.is_empty()
    }
}
