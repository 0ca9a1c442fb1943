// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Safe serialization of arbitrary state values into canonical trees.
//!
//! Agent state can contain user-defined records, enums, timestamps, byte
//! blobs, and deeply nested structures. [`serialize_state`] converts any
//! `Serialize` value into a `serde_json::Value` tree that can be stored,
//! diffed, and handed to a visualizer.
//!
//! Design decisions:
//! - The function is total: it never fails and never mutates its input.
//!   A failing `Serialize` impl degrades to an `<unserializable: ..>`
//!   sentinel at the nearest container boundary instead of aborting.
//! - Non-finite floats have no JSON representation; they are rendered as
//!   the sentinel strings `"NaN"`, `"Infinity"`, and `"-Infinity"`.
//! - Byte blobs are summarized as `<bytes len=N>` with a truncation marker
//!   past an inline limit; raw payloads never enter the tree.
//! - Recursion is cut at a fixed depth with a `<circular reference>`
//!   sentinel. Serde exposes no object identity, so a cyclic shared-pointer
//!   graph manifests exactly as unbounded depth.
//! - Collections keep their iteration order: serde presents sets and
//!   vectors identically to a serializer, so re-sorting cannot be scoped
//!   to unordered inputs without also reordering positional lists. Sorted
//!   trees come from sorted collection types (`BTreeSet`, `BTreeMap`); a
//!   `HashSet` passes through in its (randomized) iteration order. See
//!   the open-question decisions in DESIGN.md.

use std::fmt;

use serde::ser::{self, Serialize};
use serde_json::{Map, Number, Value};

/// Sentinel emitted where recursion exceeds [`MAX_DEPTH`].
const CIRCULAR_REF: &str = "<circular reference>";

/// Maximum nesting depth before the circular sentinel is emitted.
const MAX_DEPTH: usize = 128;

/// Maximum length of the description inside an unserializable sentinel.
const MAX_REPR_LEN: usize = 500;

/// Byte blobs up to this size are reported without a truncation marker.
const MAX_BYTES_INLINE: usize = 1024;

/// Convert an arbitrary value into a canonical JSON-compatible tree.
///
/// The output contains only null, booleans, finite numbers, strings,
/// arrays, and string-keyed objects. The conversion is idempotent (feeding
/// the resulting tree back in reproduces it unchanged) and deterministic
/// for inputs whose collections iterate deterministically; a randomized
/// `HashSet`/`HashMap` order passes through as-is.
pub fn serialize_state<T>(value: &T) -> Value
where
    T: Serialize + ?Sized,
{
    serialize_at_depth(value, 0)
}

/// Serialize a value at a given nesting depth, degrading to a sentinel on
/// serializer errors.
fn serialize_at_depth<T>(value: &T, depth: usize) -> Value
where
    T: Serialize + ?Sized,
{
    match value.serialize(TreeSerializer { depth }) {
        Ok(tree) => tree,
        Err(err) => Value::String(unserializable(&err.0)),
    }
}

/// Build the `<unserializable: ..>` sentinel, truncating long descriptions.
fn unserializable(repr: &str) -> String {
    if repr.len() <= MAX_REPR_LEN {
        return format!("<unserializable: {repr}>");
    }
    let mut end = MAX_REPR_LEN;
    while !repr.is_char_boundary(end) {
        end -= 1;
    }
    format!("<unserializable: {}...>", &repr[..end])
}

/// Sentinel string for a non-finite float.
fn non_finite_sentinel(v: f64) -> &'static str {
    if v.is_nan() {
        "NaN"
    } else if v.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

/// Coerce a map key to a string, mirroring serde_json's key handling but
/// without the possibility of failure.
fn key_to_string<T>(key: &T) -> String
where
    T: Serialize + ?Sized,
{
    match key.serialize(TreeSerializer { depth: 0 }) {
        Ok(Value::String(s)) => s,
        Ok(Value::Number(n)) => n.to_string(),
        Ok(Value::Bool(b)) => b.to_string(),
        Ok(Value::Null) => "null".to_string(),
        Ok(other) => other.to_string(),
        Err(err) => unserializable(&err.0),
    }
}

/// Internal error carrier; only produced by foreign `Serialize` impls
/// calling `Error::custom`, never by the tree builders themselves.
#[derive(Debug)]
struct TreeError(String);

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TreeError {}

impl ser::Error for TreeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        TreeError(msg.to_string())
    }
}

/// Serializer that builds the canonical tree directly.
struct TreeSerializer {
    depth: usize,
}

impl ser::Serializer for TreeSerializer {
    type Ok = Value;
    type Error = TreeError;

    type SerializeSeq = SeqTree;
    type SerializeTuple = SeqTree;
    type SerializeTupleStruct = SeqTree;
    type SerializeTupleVariant = VariantSeqTree;
    type SerializeMap = MapTree;
    type SerializeStruct = MapTree;
    type SerializeStructVariant = VariantMapTree;

    fn serialize_bool(self, v: bool) -> Result<Value, TreeError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Value, TreeError> {
        match i64::try_from(v) {
            Ok(n) => Ok(Value::from(n)),
            Err(_) => Ok(Value::String(v.to_string())),
        }
    }

    fn serialize_u8(self, v: u8) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, TreeError> {
        Ok(Value::from(v))
    }

    fn serialize_u128(self, v: u128) -> Result<Value, TreeError> {
        match u64::try_from(v) {
            Ok(n) => Ok(Value::from(n)),
            Err(_) => Ok(Value::String(v.to_string())),
        }
    }

    fn serialize_f32(self, v: f32) -> Result<Value, TreeError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, TreeError> {
        match Number::from_f64(v) {
            Some(n) => Ok(Value::Number(n)),
            None => Ok(Value::String(non_finite_sentinel(v).to_string())),
        }
    }

    fn serialize_char(self, v: char) -> Result<Value, TreeError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, TreeError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, TreeError> {
        let summary = if v.len() <= MAX_BYTES_INLINE {
            format!("<bytes len={}>", v.len())
        } else {
            format!("<bytes len={} truncated>", v.len())
        };
        Ok(Value::String(summary))
    }

    fn serialize_none(self) -> Result<Value, TreeError> {
        Ok(Value::Null)
    }

    fn serialize_some<T>(self, value: &T) -> Result<Value, TreeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, TreeError> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, TreeError> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, TreeError> {
        Ok(Value::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, TreeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, TreeError>
    where
        T: Serialize + ?Sized,
    {
        let mut map = Map::new();
        map.insert(
            variant.to_string(),
            serialize_at_depth(value, self.depth + 1),
        );
        Ok(Value::Object(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqTree, TreeError> {
        Ok(SeqTree {
            items: Vec::with_capacity(len.unwrap_or(0)),
            depth: self.depth + 1,
            elided: self.depth >= MAX_DEPTH,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqTree, TreeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqTree, TreeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqTree, TreeError> {
        Ok(VariantSeqTree {
            variant,
            inner: self.serialize_tuple(len)?,
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapTree, TreeError> {
        Ok(MapTree {
            map: Map::new(),
            next_key: None,
            depth: self.depth + 1,
            elided: self.depth >= MAX_DEPTH,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<MapTree, TreeError> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapTree, TreeError> {
        Ok(VariantMapTree {
            variant,
            inner: self.serialize_map(None)?,
        })
    }
}

/// Builder for arrays (sequences, tuples, tuple structs).
struct SeqTree {
    items: Vec<Value>,
    depth: usize,
    elided: bool,
}

impl SeqTree {
    fn push<T>(&mut self, value: &T)
    where
        T: Serialize + ?Sized,
    {
        if !self.elided {
            self.items.push(serialize_at_depth(value, self.depth));
        }
    }

    fn finish(self) -> Value {
        if self.elided {
            Value::String(CIRCULAR_REF.to_string())
        } else {
            Value::Array(self.items)
        }
    }
}

impl ser::SerializeSeq for SeqTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        Ok(self.finish())
    }
}

/// Builder for externally-tagged tuple variants.
struct VariantSeqTree {
    variant: &'static str,
    inner: SeqTree,
}

impl ser::SerializeTupleVariant for VariantSeqTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        self.inner.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        let mut map = Map::new();
        map.insert(self.variant.to_string(), self.inner.finish());
        Ok(Value::Object(map))
    }
}

/// Builder for objects (maps and structs) with string-coerced keys.
struct MapTree {
    map: Map<String, Value>,
    next_key: Option<String>,
    depth: usize,
    elided: bool,
}

impl MapTree {
    fn finish(self) -> Value {
        if self.elided {
            Value::String(CIRCULAR_REF.to_string())
        } else {
            Value::Object(self.map)
        }
    }
}

impl ser::SerializeMap for MapTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        if !self.elided {
            self.next_key = Some(key_to_string(key));
        }
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        if !self.elided {
            let key = self.next_key.take().unwrap_or_default();
            self.map.insert(key, serialize_at_depth(value, self.depth));
        }
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        if !self.elided {
            self.map
                .insert(key.to_string(), serialize_at_depth(value, self.depth));
        }
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        Ok(self.finish())
    }
}

/// Builder for externally-tagged struct variants.
struct VariantMapTree {
    variant: &'static str,
    inner: MapTree,
}

impl ser::SerializeStructVariant for VariantMapTree {
    type Ok = Value;
    type Error = TreeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), TreeError>
    where
        T: Serialize + ?Sized,
    {
        if !self.inner.elided {
            self.inner
                .map
                .insert(key.to_string(), serialize_at_depth(value, self.inner.depth));
        }
        Ok(())
    }

    fn end(self) -> Result<Value, TreeError> {
        let mut map = Map::new();
        map.insert(self.variant.to_string(), self.inner.finish());
        Ok(Value::Object(map))
    }
}
