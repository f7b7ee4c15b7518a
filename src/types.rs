/// Identity of one classification event (stable across redeliveries).
/// Example: `512034981`
pub type ClassificationId = i64;
/// Worker (volunteer) identifier. Anonymous workers map to `-99`.
/// Examples: `1874321`, `-99`
pub type WorkerId = i64;
/// Subject identifier normalized to a string, as used for `image_id` keys.
/// Example: `"48211903"`
pub type SubjectId = String;
/// Identifier of one annotation sub-task within a workflow.
/// Examples: `T0`, `T1`
pub type TaskLabel = String;
/// Identifier for the source that produced messages.
/// Examples: `queue::aggregation-input`, `replay`
pub type SourceId = String;
/// Opaque handle used to acknowledge a received queue message.
/// Example: `rh-17-2`
pub type ReceiptHandle = String;
/// Tool (mark class) label attached to a tap.
/// Examples: `0`, `galaxy`
pub type ToolLabel = String;
/// Hex-encoded MD5 digest of a message body.
/// Example: `9e107d9d372bb6826bd81d3542a419d6`
pub type BodyChecksum = String;
