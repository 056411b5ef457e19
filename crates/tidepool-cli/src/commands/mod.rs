pub mod admin;
pub mod insert;
pub mod query;

use anyhow::{Context, bail};
use bson::{Bson, Document};

/// Parse a document from JSON, accepting extended JSON (`{"$oid": ...}`).
pub fn parse_document(json: &str) -> anyhow::Result<Document> {
    let value: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("invalid JSON: {json}"))?;
    match Bson::try_from(value).context("invalid extended JSON")? {
        Bson::Document(doc) => Ok(doc),
        other => bail!("expected a JSON object, got {other}"),
    }
}

/// Relaxed extended JSON for printing.
pub fn to_json(doc: Document) -> serde_json::Value {
    Bson::Document(doc).into_relaxed_extjson()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bson::oid::ObjectId;

    #[test]
    fn parses_plain_and_extended_json() {
        let doc = parse_document(r#"{"name": "ada", "age": 36}"#).unwrap();
        assert_eq!(doc.get_str("name").unwrap(), "ada");

        let doc = parse_document(r#"{"_id": {"$oid": "507f1f77bcf86cd799439011"}}"#).unwrap();
        assert_eq!(
            doc.get_object_id("_id").unwrap(),
            ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap()
        );
    }

    #[test]
    fn rejects_non_objects() {
        assert!(parse_document("[1, 2]").is_err());
        assert!(parse_document("not json").is_err());
    }

    #[test]
    fn prints_relaxed_json() {
        let value = to_json(doc! { "n": 1, "s": "x" });
        assert_eq!(value, serde_json::json!({ "n": 1, "s": "x" }));
    }
}
