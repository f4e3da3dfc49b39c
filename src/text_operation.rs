//! Canonical text operation stored in committed changes.
//!
//! Serialized as a JSON array where a positive integer retains that many
//! chars, a string inserts it and a negative integer deletes that many chars.
//! Builders keep the operation normalized: adjacent components of one kind
//! are merged and an insert never directly follows a delete.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HistoryError, HistoryResult};

/// One component of a [`TextOperation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// Keep this many chars.
    Retain(usize),
    /// Insert this text.
    Insert(String),
    /// Remove this many chars.
    Delete(usize),
}

/// Sequence of retain/insert/delete components covering a whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextOperation {
    components: Vec<Component>,
    base_length: usize,
    target_length: usize,
}

impl TextOperation {
    /// Empty operation over an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized components.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Length of the document this operation applies to.
    pub fn base_length(&self) -> usize {
        self.base_length
    }

    /// Length of the document after applying.
    pub fn target_length(&self) -> usize {
        self.target_length
    }

    /// True when applying changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Appends a retain of `n` chars.
    pub fn retain(mut self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        self.target_length += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    /// Appends an insert, placed before a trailing delete.
    pub fn insert(mut self, text: &str) -> Self {
        if text.is_empty() {
            return self;
        }
        self.target_length += text.chars().count();
        let len = self.components.len();
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
        } else if matches!(self.components.last(), Some(Component::Delete(_))) {
            if len >= 2 {
                if let Component::Insert(prev) = &mut self.components[len - 2] {
                    prev.push_str(text);
                    return self;
                }
            }
            self.components
                .insert(len - 1, Component::Insert(text.to_string()));
        } else {
            self.components.push(Component::Insert(text.to_string()));
        }
        self
    }

    /// Appends a delete of `n` chars.
    pub fn delete(mut self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    fn push(self, component: Component) -> Self {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(text) => self.insert(&text),
            Component::Delete(n) => self.delete(n),
        }
    }

    /// Applies this operation to `text`.
    pub fn apply(&self, text: &str) -> HistoryResult<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() != self.base_length {
            return Err(HistoryError::UnexpectedResponse(format!(
                "text operation base length {} does not match document length {}",
                self.base_length,
                chars.len()
            )));
        }
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    out.extend(&chars[cursor..cursor + n]);
                    cursor += n;
                }
                Component::Insert(s) => out.push_str(s),
                Component::Delete(n) => cursor += n,
            }
        }
        Ok(out)
    }

    /// Operation equivalent to applying `self` then `other`.
    pub fn compose(&self, other: &TextOperation) -> HistoryResult<TextOperation> {
        if self.target_length != other.base_length {
            return Err(HistoryError::UnexpectedResponse(format!(
                "cannot compose operations: target length {} != base length {}",
                self.target_length, other.base_length
            )));
        }

        let mut out = TextOperation::new();
        let mut first = self.components.iter().cloned();
        let mut second = other.components.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Component::Delete(n)), next_b) => {
                    out = out.delete(n);
                    a = first.next();
                    b = next_b;
                }
                (next_a, Some(Component::Insert(text))) => {
                    out = out.insert(&text);
                    a = next_a;
                    b = second.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(HistoryError::UnexpectedResponse(
                        "cannot compose operations: length mismatch".to_string(),
                    ));
                }
                (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                    out = out.retain(x.min(y));
                    if x > y {
                        a = Some(Component::Retain(x - y));
                        b = second.next();
                    } else if x == y {
                        a = first.next();
                        b = second.next();
                    } else {
                        a = first.next();
                        b = Some(Component::Retain(y - x));
                    }
                }
                (Some(Component::Insert(text)), Some(Component::Delete(y))) => {
                    let len = text.chars().count();
                    if len > y {
                        a = Some(Component::Insert(text.chars().skip(y).collect()));
                        b = second.next();
                    } else if len == y {
                        a = first.next();
                        b = second.next();
                    } else {
                        a = first.next();
                        b = Some(Component::Delete(y - len));
                    }
                }
                (Some(Component::Insert(text)), Some(Component::Retain(y))) => {
                    let len = text.chars().count();
                    if len > y {
                        out = out.insert(&text.chars().take(y).collect::<String>());
                        a = Some(Component::Insert(text.chars().skip(y).collect()));
                        b = second.next();
                    } else if len == y {
                        out = out.insert(&text);
                        a = first.next();
                        b = second.next();
                    } else {
                        out = out.insert(&text);
                        a = first.next();
                        b = Some(Component::Retain(y - len));
                    }
                }
                (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                    out = out.delete(x.min(y));
                    if x > y {
                        a = Some(Component::Retain(x - y));
                        b = second.next();
                    } else if x == y {
                        a = first.next();
                        b = second.next();
                    } else {
                        a = first.next();
                        b = Some(Component::Delete(y - x));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<Component> for TextOperation {
    fn from_iter<T: IntoIterator<Item = Component>>(iter: T) -> Self {
        iter.into_iter()
            .fold(TextOperation::new(), |op, component| op.push(component))
    }
}

impl Serialize for TextOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.components.len()))?;
        for component in &self.components {
            match component {
                Component::Retain(n) => seq.serialize_element(&(*n as i64))?,
                Component::Insert(s) => seq.serialize_element(s)?,
                Component::Delete(n) => seq.serialize_element(&-(*n as i64))?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OpVisitor;

        impl<'de> Visitor<'de> for OpVisitor {
            type Value = TextOperation;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of retain counts, insert strings and delete counts")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Count(i64),
                    Text(String),
                }

                let mut op = TextOperation::new();
                while let Some(raw) = seq.next_element::<Raw>()? {
                    op = match raw {
                        Raw::Count(n) if n > 0 => op.retain(n as usize),
                        Raw::Count(n) if n < 0 => op.delete(n.unsigned_abs() as usize),
                        Raw::Count(_) => {
                            return Err(de::Error::custom("zero-length component"));
                        }
                        Raw::Text(s) => op.insert(&s),
                    };
                }
                Ok(op)
            }
        }

        deserializer.deserialize_seq(OpVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::TextOperation;

    #[test]
    fn compose_matches_sequential_apply() {
        let a = TextOperation::new().retain(3).insert("foo").retain(17);
        let b = TextOperation::new().retain(15).insert("bar").retain(8);
        let composed = a.compose(&b).expect("compose");
        assert_eq!(
            serde_json::to_string(&composed).expect("encode"),
            r#"[3,"foo",9,"bar",8]"#
        );

        let doc = "abcdefghijklmnopqrst";
        let stepwise = b.apply(&a.apply(doc).expect("a")).expect("b");
        assert_eq!(composed.apply(doc).expect("composed"), stepwise);
    }

    #[test]
    fn insert_after_delete_is_reordered() {
        let op = TextOperation::new().retain(1).delete(2).insert("x");
        assert_eq!(serde_json::to_string(&op).expect("encode"), r#"[1,"x",-2]"#);
        assert_eq!(op.apply("abc").expect("apply"), "ax");
    }

    #[test]
    fn decode_round_trips_counts() {
        let op: TextOperation = serde_json::from_str(r#"[2,-3,"hi",1]"#).expect("decode");
        assert_eq!(op.base_length(), 6);
        assert_eq!(op.target_length(), 5);
    }
}
