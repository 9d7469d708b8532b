//! Module-level constant interning.
//!
//! Every literal in a module is deduplicated into one table; the generated
//! class materializes each entry once in `<clinit>` into a `k$<n>` static
//! field, and all uses load that field. Interning is by value *and* type,
//! so `1` and `1.0` stay distinct even when numerically equal.

use ahash::AHashMap;
use num_bigint::BigInt;

/// A literal that compiles to a static field of the generated class.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// Fits the runtime's fixnum constructor.
    Int(i64),
    Big(BigInt),
    Float(f64),
    /// Imaginary literal; the real part is always zero at the literal level.
    Imaginary(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Hashable identity of a constant. Floats hash by their IEEE bits so
/// `0.0` and `-0.0` intern separately, matching Python literal identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Big(BigInt),
    Float(u64),
    Imaginary(u64),
    Str(String),
    Bytes(Vec<u8>),
}

impl ConstKey {
    fn of(value: &ConstValue) -> Self {
        match value {
            ConstValue::Int(v) => ConstKey::Int(*v),
            ConstValue::Big(v) => ConstKey::Big(v.clone()),
            ConstValue::Float(v) => ConstKey::Float(v.to_bits()),
            ConstValue::Imaginary(v) => ConstKey::Imaginary(v.to_bits()),
            ConstValue::Str(v) => ConstKey::Str(v.clone()),
            ConstValue::Bytes(v) => ConstKey::Bytes(v.clone()),
        }
    }
}

/// Deduplicating table of a module's literals, in first-use order.
#[derive(Debug, Default)]
pub struct ConstantTable {
    values: Vec<ConstValue>,
    indices: AHashMap<ConstKey, u16>,
}

impl ConstantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `value`, returning the index of its `k$<n>` field.
    pub fn intern(&mut self, value: ConstValue) -> u16 {
        let key = ConstKey::of(&value);
        if let Some(&idx) = self.indices.get(&key) {
            return idx;
        }
        let idx = self.values.len() as u16;
        self.indices.insert(key, idx);
        self.values.push(value);
        idx
    }

    pub fn field_name(idx: u16) -> String {
        format!("k${idx}")
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &ConstValue)> {
        self.values.iter().enumerate().map(|(i, v)| (i as u16, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn equal_literals_share_a_field() {
        let mut table = ConstantTable::new();
        let a = table.intern(ConstValue::Str("hello".to_string()));
        let b = table.intern(ConstValue::Str("hello".to_string()));
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn int_and_float_of_equal_value_stay_distinct() {
        let mut table = ConstantTable::new();
        let int_idx = table.intern(ConstValue::Int(1));
        let float_idx = table.intern(ConstValue::Float(1.0));
        assert_ne!(int_idx, float_idx);
        let imag_idx = table.intern(ConstValue::Imaginary(1.0));
        assert_ne!(float_idx, imag_idx);
    }

    #[test]
    fn signed_zeros_intern_separately() {
        let mut table = ConstantTable::new();
        let pos = table.intern(ConstValue::Float(0.0));
        let neg = table.intern(ConstValue::Float(-0.0));
        assert_ne!(pos, neg);
    }

    #[test]
    fn field_names_follow_first_use_order() {
        let mut table = ConstantTable::new();
        table.intern(ConstValue::Int(10));
        let idx = table.intern(ConstValue::Bytes(vec![1, 2]));
        assert_eq!(ConstantTable::field_name(idx), "k$1");
        let order: Vec<u16> = table.iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![0, 1]);
    }
}
