use std::collections::HashMap;

/// One decoded shard record: named flat f32 grids, all of one expected
/// length. Transient; exists only between decode and assembly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub fields: HashMap<String, Vec<f32>>,
}

impl RawRecord {
    pub fn field(&self, name: &str) -> Option<&[f32]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: String, values: Vec<f32>) -> Option<Vec<f32>> {
        self.fields.insert(name, values)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
