use bson::{Bson, Document};

use super::flags::MessageFlags;

/// One OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: the command or reply body.
    Body(Document),
    /// Kind 1: a named run of documents, e.g. the `documents` of an insert.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

/// A logical wire message, request or reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: u32,
    /// Request id this message answers; 0 for requests.
    pub response_to: u32,
    pub flags: MessageFlags,
    pub sections: Vec<Section>,
}

impl Message {
    /// A request carrying `body`. The request id is assigned when it is sent.
    pub fn command(body: Document) -> Self {
        Self {
            request_id: 0,
            response_to: 0,
            flags: MessageFlags::NONE,
            sections: vec![Section::Body(body)],
        }
    }

    pub fn reply(response_to: u32, body: Document) -> Self {
        Self {
            request_id: 0,
            response_to,
            flags: MessageFlags::NONE,
            sections: vec![Section::Body(body)],
        }
    }

    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sections.push(Section::Sequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the peer is expected to answer this request.
    pub fn expects_response(&self) -> bool {
        !self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            Section::Body(doc) => Some(doc),
            Section::Sequence { .. } => None,
        })
    }

    /// Number of documents carried across all sections.
    pub fn document_count(&self) -> usize {
        self.sections
            .iter()
            .map(|section| match section {
                Section::Body(_) => 1,
                Section::Sequence { documents, .. } => documents.len(),
            })
            .sum()
    }

    /// Collapse the message into its body, appending every document sequence
    /// to an array field named after its identifier.
    pub fn into_document(self) -> Document {
        let mut body = Document::new();
        let mut sequences = Vec::new();

        for section in self.sections {
            match section {
                Section::Body(doc) => body = doc,
                Section::Sequence {
                    identifier,
                    documents,
                } => sequences.push((identifier, documents)),
            }
        }

        for (identifier, documents) in sequences {
            let docs = documents.into_iter().map(Bson::Document);
            match body.get_mut(&identifier) {
                Some(Bson::Array(existing)) => existing.extend(docs),
                _ => {
                    body.insert(identifier, Bson::Array(docs.collect()));
                }
            }
        }

        body
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn test_into_document_folds_sequences() {
        let message = Message::command(doc! { "insert": "people" }).with_sequence(
            "documents",
            vec![doc! { "name": "John" }, doc! { "name": "Jane" }],
        );
        assert_eq!(message.document_count(), 3);

        let body = message.into_document();
        assert_eq!(
            body,
            doc! {
                "insert": "people",
                "documents": [{ "name": "John" }, { "name": "Jane" }],
            }
        );
    }

    #[test]
    fn test_into_document_extends_existing_array() {
        let message = Message::reply(4, doc! { "items": [{ "a": 1 }] })
            .with_sequence("items", vec![doc! { "a": 2 }]);
        let body = message.into_document();
        assert_eq!(body.get_array("items").unwrap().len(), 2);
    }

    #[test]
    fn test_expects_response() {
        let message = Message::command(doc! { "ping": 1 });
        assert!(message.expects_response());
        let message = message.with_flags(MessageFlags::MORE_TO_COME);
        assert!(!message.expects_response());
    }
}
