//! Bencode value tree

/// Byte range of a value in the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One dictionary entry, in source order
///
/// `span` covers the value bytes only, not the key. Equality ignores the
/// span: two trees decoded from differently laid out sources compare equal
/// when their keys and values match.
#[derive(Debug, Clone)]
pub struct DictEntry {
    pub key: Vec<u8>,
    pub value: Value,
    pub span: Span,
}

impl PartialEq for DictEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl Eq for DictEntry {}

/// Decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<DictEntry>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Bytes interpreted as UTF-8, where the grammar demands text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[DictEntry]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary value by key
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.get_entry(key).map(|e| &e.value)
    }

    /// Look up a dictionary entry (value plus source span) by key
    pub fn get_entry(&self, key: &[u8]) -> Option<&DictEntry> {
        match self {
            Value::Dict(entries) => entries.iter().find(|e| e.key == key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], value: Value) -> DictEntry {
        DictEntry {
            key: key.to_vec(),
            value,
            span: Span { start: 0, end: 0 },
        }
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Int(42).as_bytes(), None);
        assert_eq!(Value::Bytes(b"spam".to_vec()).as_bytes(), Some(b"spam".as_ref()));
        assert_eq!(Value::Bytes(b"spam".to_vec()).as_str(), Some("spam"));
        assert_eq!(Value::Bytes(vec![0xff, 0xfe]).as_str(), None);
        assert!(Value::List(vec![]).as_list().is_some());
        assert!(Value::Dict(vec![]).as_dict().is_some());
    }

    #[test]
    fn test_dict_get() {
        let dict = Value::Dict(vec![
            entry(b"a", Value::Int(1)),
            entry(b"b", Value::Int(2)),
        ]);
        assert_eq!(dict.get(b"a"), Some(&Value::Int(1)));
        assert_eq!(dict.get(b"b"), Some(&Value::Int(2)));
        assert_eq!(dict.get(b"c"), None);
        assert_eq!(Value::Int(0).get(b"a"), None);
    }

    #[test]
    fn test_entry_equality_ignores_span() {
        let a = DictEntry {
            key: b"k".to_vec(),
            value: Value::Int(7),
            span: Span { start: 3, end: 8 },
        };
        let b = DictEntry {
            key: b"k".to_vec(),
            value: Value::Int(7),
            span: Span { start: 90, end: 95 },
        };
        assert_eq!(a, b);
    }
}
